//! E2E tests for the server connection state machine
//!
//! Verifies the open/close round trip, notification ordering, the
//! exactly-once disconnect guarantee under races, and probe-derived
//! control ownership.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use soundbridge::{DummyServer, ServerConnection};

struct Counters {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    reasons: Mutex<Vec<String>>,
}

impl Counters {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
            reasons: Mutex::new(Vec::new()),
        })
    }

    fn subscribe(self: &Arc<Self>, connection: &ServerConnection) {
        let c = Arc::clone(self);
        connection.on_connected(Box::new(move || {
            c.connected.fetch_add(1, Ordering::SeqCst);
        }));
        let c = Arc::clone(self);
        connection.on_disconnected(Box::new(move |reason| {
            c.disconnected.fetch_add(1, Ordering::SeqCst);
            c.reasons.lock().unwrap().push(reason.to_string());
        }));
    }
}

/// open() then close() fires exactly one Connected and one Disconnected,
/// in that order
#[test]
fn connection_round_trip() {
    let server = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(server.connector(), "engine");
    let counters = Counters::new();
    counters.subscribe(&connection);

    assert!(!connection.connected());
    connection.open().expect("open must succeed");
    assert!(connection.connected());
    assert_eq!(counters.connected.load(Ordering::SeqCst), 1);
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 0);

    connection.close().expect("close must succeed");
    assert!(!connection.connected());
    assert_eq!(counters.connected.load(Ordering::SeqCst), 1);
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(counters.reasons.lock().unwrap().as_slice(), [""]);
}

/// Closing a connection that was never opened is a distinguishable no-op
#[test]
fn close_when_disconnected_errs() {
    let server = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(server.connector(), "engine");
    let counters = Counters::new();
    counters.subscribe(&connection);

    assert!(connection.close().is_err());
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 0);
}

/// Failed open leaves the handle null and fires nothing
#[test]
fn failed_open_has_no_side_effects() {
    let server = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(server.connector(), "engine");
    let counters = Counters::new();
    counters.subscribe(&connection);

    server.fail_next_connect();
    assert!(connection.open().is_err());
    assert!(!connection.connected());
    assert_eq!(counters.connected.load(Ordering::SeqCst), 0);

    // A retry without the failure works
    connection.open().expect("retry must succeed");
    assert!(connection.connected());
}

/// An asynchronous server shutdown carries the server's reason
#[test]
fn async_shutdown_reports_reason() {
    let server = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(server.connector(), "engine");
    let counters = Counters::new();
    counters.subscribe(&connection);

    connection.open().unwrap();
    server.kill("watchdog timeout");

    assert!(!connection.connected());
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(
        counters.reasons.lock().unwrap().as_slice(),
        ["watchdog timeout"]
    );
}

/// A shutdown racing an explicit close produces exactly one Disconnected
#[test]
fn no_double_disconnect_under_race() {
    for _ in 0..8 {
        let server = DummyServer::new(48000, 1024);
        let connection = ServerConnection::new(server.connector(), "engine");
        let counters = Counters::new();
        counters.subscribe(&connection);

        connection.open().unwrap();

        let closer = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || {
                let _ = connection.close();
            })
        };
        server.kill("server crashed");
        closer.join().unwrap();

        assert_eq!(
            counters.disconnected.load(Ordering::SeqCst),
            1,
            "disconnect must fire exactly once no matter who wins the race"
        );
    }
}

/// Reopening an open connection closes the old one first
#[test]
fn open_is_idempotent() {
    let server = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(server.connector(), "engine");
    let counters = Counters::new();
    counters.subscribe(&connection);

    connection.open().unwrap();
    connection.open().unwrap();

    assert!(connection.connected());
    assert_eq!(counters.connected.load(Ordering::SeqCst), 2);
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
}

/// Probe decides control ownership once, before the real connection
#[test]
fn probe_decides_in_control() {
    let ours = DummyServer::new(48000, 1024);
    let connection = ServerConnection::new(ours.connector(), "engine");
    assert!(connection.in_control());

    let external = DummyServer::new_external(44100, 512);
    let connection = ServerConnection::new(external.connector(), "engine");
    assert!(!connection.in_control());
    assert_eq!(connection.probed_sample_rate(), 44100);
    assert_eq!(connection.probed_buffer_size(), 512);
}

/// The server's alternate name after a collision is adopted silently
#[test]
fn name_collision_resolved_silently() {
    let server = DummyServer::new(48000, 1024);

    let first = ServerConnection::new(server.connector(), "engine");
    first.open().unwrap();

    let second = ServerConnection::new(server.connector(), "engine");
    second.open().unwrap();

    let handle = second.handle().expect("second connection is live");
    assert_eq!(handle.client_name(), "engine-02");
}
