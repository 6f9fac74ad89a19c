//! E2E tests for the port engine surface
//!
//! Registration, lookup fast/slow paths, connection management, buffer and
//! MIDI access, latency ranges, and the event-driven tracking of foreign
//! ports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use soundbridge::server::discovery;
use soundbridge::{
    DataKind, DummyServer, EngineCallbacks, LatencyRange, PatchbayBackend, PortFlags,
    ServerConnection,
};

#[derive(Default)]
struct RecordingEngine {
    connections: Mutex<Vec<(String, String, bool)>>,
    ports_changed: AtomicUsize,
    latency_updates: AtomicUsize,
}

impl EngineCallbacks for RecordingEngine {
    fn connection_changed(&self, a: &str, b: &str, connected: bool) {
        self.connections
            .lock()
            .unwrap()
            .push((a.to_string(), b.to_string(), connected));
    }

    fn ports_changed(&self) {
        self.ports_changed.fetch_add(1, Ordering::SeqCst);
    }

    fn latency_updated(&self, _playback: bool) {
        self.latency_updates.fetch_add(1, Ordering::SeqCst);
    }
}

fn started_backend(server: &DummyServer) -> (Arc<PatchbayBackend>, Arc<RecordingEngine>) {
    let connection = ServerConnection::new(server.connector(), "engine");
    let engine = Arc::new(RecordingEngine::default());
    let backend = PatchbayBackend::new(connection, engine.clone());
    backend.set_driver(discovery::DUMMY_DRIVER).unwrap();
    backend.start(false).unwrap();
    (backend, engine)
}

/// Register, look up, connect and unregister our own ports
#[test]
fn own_port_round_trip() {
    let server = DummyServer::new(48000, 1024);
    server.add_system_ports(2, 2);
    let (backend, _engine) = started_backend(&server);

    let out = backend
        .register_port("out_1", DataKind::Audio, PortFlags::output())
        .unwrap();
    assert_eq!(out.name(), "engine:out_1");
    assert!(out.is_mine());

    // Fast path: the registry answers without a server query
    let looked_up = backend.registry().lookup("engine:out_1").unwrap();
    assert!(looked_up.same_port(&out));

    backend.connect("engine:out_1", "system:playback_1").unwrap();
    assert_eq!(
        backend.get_connections(&out),
        vec!["system:playback_1".to_string()]
    );
    assert!(backend.physically_connected(&out));

    backend.disconnect("engine:out_1", "system:playback_1").unwrap();
    assert!(backend.get_connections(&out).is_empty());

    backend.unregister_port(&out).unwrap();
    assert!(backend.registry().lookup("engine:out_1").is_none());
}

/// Slow-path lookup caches a foreign port in the registry
#[test]
fn foreign_port_lookup_falls_back_to_server() {
    let server = DummyServer::new(48000, 1024);
    let (backend, _engine) = started_backend(&server);
    // System ports appear after the backend connected without a
    // registration broadcast, so the registry has never seen them
    server.add_system_ports(1, 1);

    let capture = backend.port_by_name("system:capture_1").unwrap();
    assert!(!capture.is_mine());
    assert!(capture.flags().is_physical);

    // Second lookup is served from the registry
    let again = backend.port_by_name("system:capture_1").unwrap();
    assert!(again.same_port(&capture));
    assert_eq!(backend.registry().len(), 1);
}

/// get_ports filters by pattern, type and flags, and degrades to empty
/// while disconnected
#[test]
fn get_ports_filters_and_degrades() {
    let server = DummyServer::new(48000, 1024);
    server.add_system_ports(2, 2);
    let (backend, _engine) = started_backend(&server);

    let playbacks = backend.get_ports(
        None,
        Some(DataKind::Audio),
        PortFlags::input().physical(true),
    );
    assert_eq!(playbacks, vec!["system:playback_1", "system:playback_2"]);

    let by_pattern = backend.get_ports(Some("capture"), None, PortFlags::default());
    assert_eq!(by_pattern.len(), 2);

    backend.stop().unwrap();
    assert!(backend
        .get_ports(None, None, PortFlags::default())
        .is_empty());
}

/// Audio buffers are writable for a cycle's worth of frames
#[test]
fn audio_buffer_access() {
    let server = DummyServer::new(48000, 1024);
    let (backend, _engine) = started_backend(&server);

    let out = backend
        .register_port("out_1", DataKind::Audio, PortFlags::output())
        .unwrap();

    let buffer = backend.audio_buffer(&out, 1024).unwrap();
    assert_eq!(buffer.len(), 1024);
    buffer[0] = 0.5;
    buffer[1023] = -0.5;

    let reread = backend.audio_buffer(&out, 1024).unwrap();
    assert_eq!(reread[0], 0.5);
    assert_eq!(reread[1023], -0.5);
}

/// MIDI event iteration through the backend surface
#[test]
fn midi_event_iteration() {
    let server = DummyServer::new(48000, 1024);
    let (backend, _engine) = started_backend(&server);

    let port = backend
        .register_port("midi_out", DataKind::Midi, PortFlags::output())
        .unwrap();

    assert_eq!(backend.midi_event_count(&port), 0);
    backend.midi_event_put(&port, 0, &[0x90, 64, 100]).unwrap();
    backend.midi_event_put(&port, 480, &[0x80, 64, 0]).unwrap();
    assert_eq!(backend.midi_event_count(&port), 2);

    let mut buf = [0u8; 8];
    let info = backend.midi_event_get(&port, 0, &mut buf).unwrap();
    assert_eq!(info.time, 0);
    assert_eq!(info.size, 3);
    assert_eq!(&buf[..3], &[0x90, 64, 100]);

    backend.midi_clear(&port);
    assert_eq!(backend.midi_event_count(&port), 0);
}

/// Latency ranges round trip through the server
#[test]
fn latency_ranges_round_trip() {
    let server = DummyServer::new(48000, 1024);
    let (backend, _engine) = started_backend(&server);

    let port = backend
        .register_port("out_1", DataKind::Audio, PortFlags::output())
        .unwrap();

    assert_eq!(backend.latency_range(&port, true), LatencyRange::default());

    backend.set_latency_range(&port, true, LatencyRange { min: 64, max: 128 });
    assert_eq!(
        backend.latency_range(&port, true),
        LatencyRange { min: 64, max: 128 }
    );
    // The capture direction is independent
    assert_eq!(backend.latency_range(&port, false), LatencyRange::default());
}

/// A port registered by another client lands in the registry via the
/// registration callback, with latency and graph hints forwarded
#[test]
fn foreign_registration_tracked_from_events() {
    let server = DummyServer::new(48000, 1024);
    let (backend, engine) = started_backend(&server);

    let other = server.connector().connect("looper").unwrap();
    let port = other
        .register_port("out", DataKind::Audio, PortFlags::output())
        .unwrap();

    let tracked = backend.registry().lookup("looper:out").unwrap();
    assert!(!tracked.is_mine());
    assert_eq!(engine.ports_changed.load(Ordering::SeqCst), 1);
    // Both directions per registration event
    assert_eq!(engine.latency_updates.load(Ordering::SeqCst), 2);

    other.unregister_port(port).unwrap();
    assert!(backend.registry().lookup("looper:out").is_none());
}

/// Connection change storms are suppressed during bulk port teardown
#[test]
fn bulk_cleanup_suppresses_connect_events() {
    let server = DummyServer::new(48000, 1024);
    server.add_system_ports(0, 2);
    let (backend, engine) = started_backend(&server);

    let a = backend
        .register_port("out_1", DataKind::Audio, PortFlags::output())
        .unwrap();
    let b = backend
        .register_port("out_2", DataKind::Audio, PortFlags::output())
        .unwrap();
    backend.connect("engine:out_1", "system:playback_1").unwrap();
    backend.connect("engine:out_2", "system:playback_2").unwrap();

    let before = engine.connections.lock().unwrap().len();
    assert_eq!(before, 2);

    backend.with_bulk_port_cleanup(|| {
        backend.disconnect_all(&a).unwrap();
        backend.disconnect_all(&b).unwrap();
        backend.unregister_port(&a).unwrap();
        backend.unregister_port(&b).unwrap();
    });

    // No disconnect notifications leaked through
    let after = engine.connections.lock().unwrap();
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|(_, _, connected)| *connected));
}

/// Queries on a dead handle report nothing instead of failing loudly
#[test]
fn queries_degrade_after_server_death() {
    let server = DummyServer::new(48000, 1024);
    let (backend, _engine) = started_backend(&server);

    let port = backend
        .register_port("out_1", DataKind::Audio, PortFlags::output())
        .unwrap();

    server.kill("gone");

    assert!(backend.get_connections(&port).is_empty());
    assert!(!backend.physically_connected(&port));
    assert_eq!(backend.midi_event_count(&port), 0);
    assert!(backend.audio_buffer(&port, 1024).is_none());
    // The registry was cleared because its references died with the server
    assert!(backend.registry().is_empty());
}
