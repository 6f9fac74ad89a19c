//! In-process dummy patchbay server
//!
//! A complete [`ServerConnector`]/[`ServerApi`] implementation with no audio
//! hardware behind it, in the spirit of the real server's "dummy" driver.
//! It backs the demo CLI and every scenario test: tests drive processing
//! cycles by hand and inject the events a live server would deliver
//! (xruns, buffer size changes, transport motion, session save requests,
//! asynchronous death).
//!
//! Control-path state lives behind plain mutexes; only the cycle handshake
//! (`cycle_wait`/`cycle_signal`) uses lock-free channels, because the
//! client's process thread blocks there.

use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::server::api::{
    DataKind, LatencyRange, MidiEventInfo, PortFlags, PortRef, ProbeOutcome, SaveEvent, SaveKind,
    ServerApi, ServerConnector, ServerError, ServerEvents, ServerTransport, TransportPosition,
};

/// Largest cycle the dummy server will ever deliver
const MAX_BUFFER_FRAMES: usize = 8192;

/// Raw MIDI bytes available per port buffer
const MIDI_BUFFER_BYTES: usize = 32768;

/// How long a driven cycle may take before the test gives up on it
const CYCLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-capacity audio buffer mutated through a shared reference.
///
/// Soundness contract: the server hands the buffer to exactly one process
/// thread per cycle; nothing else touches it until the cycle is signalled
/// complete. The capacity never changes, so the pointer stays valid for the
/// port's lifetime.
struct AudioCell(std::cell::UnsafeCell<Box<[f32]>>);

unsafe impl Sync for AudioCell {}

impl AudioCell {
    fn new() -> Self {
        Self(std::cell::UnsafeCell::new(
            vec![0.0; MAX_BUFFER_FRAMES].into_boxed_slice(),
        ))
    }

    fn ptr(&self) -> NonNull<f32> {
        // Capacity is fixed at construction, the box is never reallocated
        let slice = unsafe { &mut *self.0.get() };
        NonNull::new(slice.as_mut_ptr()).expect("buffer allocation cannot be null")
    }
}

struct DummyPort {
    name: String,
    kind: DataKind,
    flags: PortFlags,
    capture_latency: LatencyRange,
    playback_latency: LatencyRange,
    audio: AudioCell,
    midi: Mutex<Vec<(u32, Vec<u8>)>>,
}

#[derive(Default)]
struct PortTable {
    next_ref: u64,
    ports: HashMap<u64, DummyPort>,
    by_name: HashMap<String, u64>,
    /// Directed (source name, destination name) pairs
    connections: Vec<(String, String)>,
}

struct TransportStatus {
    state: ServerTransport,
    frame: u64,
}

struct Inner {
    running: AtomicBool,
    externally_managed: bool,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
    fail_next_connect: AtomicBool,
    fail_next_activate: AtomicBool,
    clients: Mutex<Vec<Arc<DummyClient>>>,
    ports: Mutex<PortTable>,
    transport: Mutex<TransportStatus>,
    timebase_holder: Mutex<Option<String>>,
    last_position: Mutex<TransportPosition>,
    save_replies: Mutex<Vec<SaveEvent>>,
    next_uuid: AtomicU64,
    completed_cycles: AtomicU64,
}

/// Handle tests and the demo CLI use to run and prod the dummy server
pub struct DummyServer {
    inner: Arc<Inner>,
}

impl DummyServer {
    /// A server this process will be in control of (probe finds nothing;
    /// the first connect auto-starts it)
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self::build(sample_rate, buffer_size, false)
    }

    /// A server some other process already started (probe finds it running;
    /// connecting clients are not in control)
    pub fn new_external(sample_rate: u32, buffer_size: u32) -> Self {
        Self::build(sample_rate, buffer_size, true)
    }

    fn build(sample_rate: u32, buffer_size: u32, external: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(external),
                externally_managed: external,
                sample_rate: AtomicU32::new(sample_rate),
                buffer_size: AtomicU32::new(buffer_size),
                fail_next_connect: AtomicBool::new(false),
                fail_next_activate: AtomicBool::new(false),
                clients: Mutex::new(Vec::new()),
                ports: Mutex::new(PortTable::default()),
                transport: Mutex::new(TransportStatus {
                    state: ServerTransport::Stopped,
                    frame: 0,
                }),
                timebase_holder: Mutex::new(None),
                last_position: Mutex::new(TransportPosition::default()),
                save_replies: Mutex::new(Vec::new()),
                next_uuid: AtomicU64::new(1),
                completed_cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Connector to hand to a `ServerConnection`
    pub fn connector(&self) -> Box<dyn ServerConnector> {
        Box::new(DummyConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Make the next `connect` fail, as if the server were unreachable
    pub fn fail_next_connect(&self) {
        self.inner.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Make the next `activate` fail
    pub fn fail_next_activate(&self) {
        self.inner.fail_next_activate.store(true, Ordering::SeqCst);
    }

    /// Register hardware-style ports the way a driver would at startup
    pub fn add_system_ports(&self, captures: u32, playbacks: u32) {
        let mut table = self.inner.ports.lock().unwrap();
        for i in 1..=captures {
            Inner::insert_port(
                &mut table,
                format!("system:capture_{}", i),
                DataKind::Audio,
                PortFlags::output().physical(true),
            );
        }
        for i in 1..=playbacks {
            let flags = PortFlags {
                is_input: true,
                is_physical: true,
                is_terminal: true,
                ..Default::default()
            };
            Inner::insert_port(&mut table, format!("system:playback_{}", i), DataKind::Audio, flags);
        }
    }

    /// Kill the server: every client's shutdown hook fires with `reason`
    /// on the calling thread
    pub fn kill(&self, reason: &str) {
        self.inner.running.store(false, Ordering::SeqCst);

        let clients: Vec<Arc<DummyClient>> =
            std::mem::take(&mut *self.inner.clients.lock().unwrap());
        for client in clients {
            client.die(reason);
        }
    }

    /// Deliver an xrun notification to every client
    pub fn trigger_xrun(&self) {
        for events in self.inner.event_handlers() {
            events.xrun();
        }
    }

    /// Change the server buffer size and notify every client
    pub fn change_buffer_size(&self, frames: u32) {
        self.inner.apply_buffer_size(frames);
    }

    /// Change the server sample rate and notify every client
    pub fn change_sample_rate(&self, rate: u32) {
        self.inner.sample_rate.store(rate, Ordering::SeqCst);
        for events in self.inner.event_handlers() {
            events.sample_rate_changed(rate);
        }
    }

    /// Force a transport state without running the sync protocol
    pub fn force_transport_state(&self, state: ServerTransport) {
        self.inner.transport.lock().unwrap().state = state;
    }

    /// Deliver a session save request to every client
    pub fn request_save(&self, kind: SaveKind, session_dir: &str) {
        let clients: Vec<Arc<DummyClient>> = self.inner.clients.lock().unwrap().clone();
        for client in clients {
            let event = SaveEvent {
                kind,
                session_dir: PathBuf::from(session_dir),
                client_uuid: client.uuid.clone(),
                command_line: String::new(),
                error: false,
            };
            if let Some(events) = client.events() {
                events.session_event(event);
            }
        }
    }

    /// Replies collected from `session_reply`
    pub fn save_replies(&self) -> Vec<SaveEvent> {
        self.inner.save_replies.lock().unwrap().clone()
    }

    /// Ask the timebase master (if any) to fill a position for the current
    /// transport frame
    pub fn query_timebase(&self) -> TransportPosition {
        self.inner.run_timebase(self.inner.buffer_size.load(Ordering::SeqCst));
        *self.inner.last_position.lock().unwrap()
    }

    /// Drive one processing cycle of `frames` on every active client and
    /// wait for completion.
    ///
    /// Returns false if any client failed to signal completion in time.
    pub fn run_cycle(&self, frames: u32) -> bool {
        let clients: Vec<Arc<DummyClient>> = self.inner.clients.lock().unwrap().clone();
        let mut all_done = true;

        for client in &clients {
            if !client.active.load(Ordering::SeqCst) {
                continue;
            }
            if client.cycle_tx.send(frames).is_err() {
                all_done = false;
                continue;
            }
            match client.done_rx.recv_timeout(CYCLE_TIMEOUT) {
                Ok(_) => {
                    self.inner.completed_cycles.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => all_done = false,
            }
        }

        self.inner.run_timebase(frames);
        {
            let mut t = self.inner.transport.lock().unwrap();
            if t.state == ServerTransport::Rolling {
                t.frame += frames as u64;
            }
        }

        all_done
    }

    /// Cycles completed by clients since the server was created
    pub fn completed_cycles(&self) -> u64 {
        self.inner.completed_cycles.load(Ordering::SeqCst)
    }

    /// Names of currently registered ports
    pub fn port_names(&self) -> Vec<String> {
        let table = self.inner.ports.lock().unwrap();
        table.by_name.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn event_handlers(&self) -> Vec<Arc<dyn ServerEvents>> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.events())
            .collect()
    }

    fn insert_port(table: &mut PortTable, name: String, kind: DataKind, flags: PortFlags) -> u64 {
        table.next_ref += 1;
        let id = table.next_ref;
        table.ports.insert(
            id,
            DummyPort {
                name: name.clone(),
                kind,
                flags,
                capture_latency: LatencyRange::default(),
                playback_latency: LatencyRange::default(),
                audio: AudioCell::new(),
                midi: Mutex::new(Vec::new()),
            },
        );
        table.by_name.insert(name, id);
        id
    }

    fn apply_buffer_size(&self, frames: u32) {
        self.buffer_size.store(frames, Ordering::SeqCst);
        for events in self.event_handlers() {
            events.buffer_size_changed(frames);
        }
    }

    fn run_timebase(&self, frames: u32) {
        let holder = self.timebase_holder.lock().unwrap().clone();
        let Some(holder) = holder else { return };

        let client = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == holder)
            .cloned();
        let Some(client) = client else { return };
        let Some(events) = client.events() else { return };

        let (state, frame) = {
            let t = self.transport.lock().unwrap();
            (t.state, t.frame)
        };
        let mut pos = TransportPosition {
            frame,
            ..Default::default()
        };
        events.timebase(state, frames, &mut pos, false);
        *self.last_position.lock().unwrap() = pos;
    }

    /// Run the transport sync protocol: every client is asked, and the
    /// transport rolls only once all of them agree
    fn run_sync(&self) {
        let (state, frame) = {
            let t = self.transport.lock().unwrap();
            (t.state, t.frame)
        };
        if state != ServerTransport::Starting {
            return;
        }

        let mut all_ready = true;
        for events in self.event_handlers() {
            if !events.sync(state, frame) {
                all_ready = false;
            }
        }
        if all_ready {
            self.transport.lock().unwrap().state = ServerTransport::Rolling;
        }
    }
}

struct DummyConnector {
    inner: Arc<Inner>,
}

impl ServerConnector for DummyConnector {
    fn probe(&self, _client_name: &str) -> ProbeOutcome {
        let running = self.inner.running.load(Ordering::SeqCst);
        if running && self.inner.externally_managed {
            ProbeOutcome {
                server_was_running: true,
                sample_rate: self.inner.sample_rate.load(Ordering::SeqCst),
                buffer_size: self.inner.buffer_size.load(Ordering::SeqCst),
            }
        } else {
            ProbeOutcome {
                server_was_running: false,
                sample_rate: 0,
                buffer_size: 0,
            }
        }
    }

    fn connect(&self, client_name: &str) -> Result<Arc<dyn ServerApi>, ServerError> {
        if self.inner.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(ServerError::Refused("server unreachable".to_string()));
        }

        // A connect from the controlling process auto-starts the server
        self.inner.running.store(true, Ordering::SeqCst);

        let mut clients = self.inner.clients.lock().unwrap();
        let taken = clients.iter().filter(|c| {
            c.name == client_name || c.name.starts_with(&format!("{}-", client_name))
        });
        let collisions = taken.count();
        let assigned = if collisions == 0 {
            client_name.to_string()
        } else {
            format!("{}-{:02}", client_name, collisions + 1)
        };

        let uuid = self.inner.next_uuid.fetch_add(1, Ordering::SeqCst);
        let (cycle_tx, cycle_rx) = bounded::<u32>(4);
        let (done_tx, done_rx) = bounded::<i32>(4);

        let client = Arc::new(DummyClient {
            inner: Arc::clone(&self.inner),
            name: assigned,
            uuid: uuid.to_string(),
            alive: AtomicBool::new(true),
            active: AtomicBool::new(false),
            events: Mutex::new(None),
            shutdown_hook: Mutex::new(None),
            process_target: Mutex::new(None),
            process_thread: Mutex::new(None),
            cycle_tx,
            cycle_rx,
            done_tx,
            done_rx,
        });
        clients.push(Arc::clone(&client));

        Ok(client)
    }
}

struct DummyClient {
    inner: Arc<Inner>,
    name: String,
    uuid: String,
    alive: AtomicBool,
    active: AtomicBool,
    events: Mutex<Option<Arc<dyn ServerEvents>>>,
    shutdown_hook: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    process_target: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    process_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    cycle_tx: Sender<u32>,
    cycle_rx: Receiver<u32>,
    done_tx: Sender<i32>,
    done_rx: Receiver<i32>,
}

impl DummyClient {
    fn events(&self) -> Option<Arc<dyn ServerEvents>> {
        self.events.lock().unwrap().clone()
    }

    fn die(&self, reason: &str) {
        // The cleared alive flag also wakes the process thread out of
        // cycle_wait
        self.alive.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        let hook = self.shutdown_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }

    fn check_alive(&self) -> Result<(), ServerError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServerError::NotConnected)
        }
    }
}

impl ServerApi for DummyClient {
    fn client_name(&self) -> String {
        self.name.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::SeqCst)
    }

    fn buffer_size(&self) -> u32 {
        self.inner.buffer_size.load(Ordering::SeqCst)
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn cpu_load(&self) -> f32 {
        0.0
    }

    fn real_time_priority(&self) -> i32 {
        80
    }

    fn buffer_capacity(&self, kind: DataKind) -> usize {
        match kind {
            DataKind::Audio => {
                self.inner.buffer_size.load(Ordering::SeqCst) as usize * std::mem::size_of::<f32>()
            }
            DataKind::Midi => MIDI_BUFFER_BYTES,
        }
    }

    fn set_buffer_size(&self, frames: u32) -> Result<(), ServerError> {
        self.check_alive()?;
        if !frames.is_power_of_two() || frames as usize > MAX_BUFFER_FRAMES {
            return Err(ServerError::Refused(format!(
                "unsupported buffer size {}",
                frames
            )));
        }
        self.inner.apply_buffer_size(frames);
        Ok(())
    }

    fn set_freewheel(&self, on: bool) -> Result<(), ServerError> {
        self.check_alive()?;
        for events in self.inner.event_handlers() {
            events.freewheel_changed(on);
        }
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn ServerEvents>) {
        *self.events.lock().unwrap() = Some(handler);
    }

    fn on_shutdown(&self, hook: Box<dyn Fn(&str) + Send + Sync>) {
        *self.shutdown_hook.lock().unwrap() = Some(hook);
    }

    fn set_process_target(&self, target: Box<dyn FnOnce() + Send>) {
        *self.process_target.lock().unwrap() = Some(target);
    }

    fn cycle_wait(&self) -> Option<u32> {
        // Both ends of the cycle channel live in this struct, so a plain
        // recv() would never observe disconnection. Poll the alive flag so
        // close() and kill() wake the process thread promptly.
        loop {
            if !self.alive.load(Ordering::SeqCst) {
                return None;
            }
            match self.cycle_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(frames) => return Some(frames),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn cycle_signal(&self, status: i32) {
        let _ = self.done_tx.send(status);
    }

    fn activate(&self) -> Result<(), ServerError> {
        self.check_alive()?;
        if self.inner.fail_next_activate.swap(false, Ordering::SeqCst) {
            return Err(ServerError::Refused("activation failed".to_string()));
        }

        if let Some(target) = self.process_target.lock().unwrap().take() {
            let thread = std::thread::Builder::new()
                .name("patchbay-process".to_string())
                .spawn(target)
                .map_err(|e| ServerError::Refused(e.to_string()))?;
            *self.process_thread.lock().unwrap() = Some(thread);
        }

        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Drain any queued cycle so the process thread sees the closed
        // handshake instead of stale work
        while self.cycle_rx.try_recv().is_ok() {}
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);

        // The cleared alive flag lets the process thread leave cycle_wait
        let thread = self.process_thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }

        let mut clients = self.inner.clients.lock().unwrap();
        clients.retain(|c| c.name != self.name);
    }

    fn transport_start(&self) {
        {
            let mut t = self.inner.transport.lock().unwrap();
            if t.state == ServerTransport::Rolling {
                return;
            }
            t.state = ServerTransport::Starting;
        }
        self.inner.run_sync();
    }

    fn transport_stop(&self) {
        self.inner.transport.lock().unwrap().state = ServerTransport::Stopped;
    }

    fn transport_locate(&self, frame: u64) {
        {
            let mut t = self.inner.transport.lock().unwrap();
            t.frame = frame;
            if t.state == ServerTransport::Rolling {
                t.state = ServerTransport::Starting;
            }
        }
        self.inner.run_sync();
    }

    fn transport_query(&self) -> (ServerTransport, TransportPosition) {
        let t = self.inner.transport.lock().unwrap();
        let pos = TransportPosition {
            frame: t.frame,
            ..Default::default()
        };
        (t.state, pos)
    }

    fn transport_frame(&self) -> u64 {
        self.inner.transport.lock().unwrap().frame
    }

    fn set_timebase(&self, enabled: bool) -> Result<(), ServerError> {
        self.check_alive()?;
        let mut holder = self.inner.timebase_holder.lock().unwrap();
        if enabled {
            *holder = Some(self.name.clone());
        } else if holder.as_deref() == Some(self.name.as_str()) {
            *holder = None;
        }
        Ok(())
    }

    fn session_reply(&self, event: SaveEvent) {
        self.inner.save_replies.lock().unwrap().push(event);
    }

    fn register_port(
        &self,
        name: &str,
        kind: DataKind,
        flags: PortFlags,
    ) -> Result<PortRef, ServerError> {
        self.check_alive()?;
        let full_name = format!("{}:{}", self.name, name);

        let id = {
            let mut table = self.inner.ports.lock().unwrap();
            if table.by_name.contains_key(&full_name) {
                return Err(ServerError::NameInUse(full_name));
            }
            Inner::insert_port(&mut table, full_name.clone(), kind, flags)
        };

        for events in self.inner.event_handlers() {
            events.port_registration(PortRef(id), &full_name, true);
        }
        Ok(PortRef(id))
    }

    fn unregister_port(&self, port: PortRef) -> Result<(), ServerError> {
        let name = {
            let mut table = self.inner.ports.lock().unwrap();
            let Some(removed) = table.ports.remove(&port.0) else {
                return Err(ServerError::UnknownPort);
            };
            table.by_name.remove(&removed.name);
            let name = removed.name;
            table
                .connections
                .retain(|(a, b)| a != &name && b != &name);
            name
        };

        for events in self.inner.event_handlers() {
            events.port_registration(port, &name, false);
        }
        Ok(())
    }

    fn port_by_name(&self, name: &str) -> Option<PortRef> {
        let table = self.inner.ports.lock().unwrap();
        table.by_name.get(name).map(|id| PortRef(*id))
    }

    fn port_name(&self, port: PortRef) -> Option<String> {
        let table = self.inner.ports.lock().unwrap();
        table.ports.get(&port.0).map(|p| p.name.clone())
    }

    fn port_kind(&self, port: PortRef) -> Option<DataKind> {
        let table = self.inner.ports.lock().unwrap();
        table.ports.get(&port.0).map(|p| p.kind)
    }

    fn port_flags(&self, port: PortRef) -> Option<PortFlags> {
        let table = self.inner.ports.lock().unwrap();
        table.ports.get(&port.0).map(|p| p.flags)
    }

    fn connect_ports(&self, src: &str, dst: &str) -> Result<(), ServerError> {
        self.check_alive()?;
        {
            let mut table = self.inner.ports.lock().unwrap();
            if !table.by_name.contains_key(src) || !table.by_name.contains_key(dst) {
                return Err(ServerError::UnknownPort);
            }
            let pair = (src.to_string(), dst.to_string());
            if table.connections.contains(&pair) {
                return Ok(());
            }
            table.connections.push(pair);
        }

        for events in self.inner.event_handlers() {
            events.ports_connected(src, dst, true);
        }
        Ok(())
    }

    fn disconnect_ports(&self, src: &str, dst: &str) -> Result<(), ServerError> {
        self.check_alive()?;
        let removed = {
            let mut table = self.inner.ports.lock().unwrap();
            let before = table.connections.len();
            table
                .connections
                .retain(|(a, b)| !(a == src && b == dst));
            before != table.connections.len()
        };

        if removed {
            for events in self.inner.event_handlers() {
                events.ports_connected(src, dst, false);
            }
        }
        Ok(())
    }

    fn disconnect_all(&self, port: PortRef) -> Result<(), ServerError> {
        let name = self.port_name(port).ok_or(ServerError::UnknownPort)?;
        let pairs: Vec<(String, String)> = {
            let table = self.inner.ports.lock().unwrap();
            table
                .connections
                .iter()
                .filter(|(a, b)| a == &name || b == &name)
                .cloned()
                .collect()
        };
        for (a, b) in pairs {
            self.disconnect_ports(&a, &b)?;
        }
        Ok(())
    }

    fn port_connections(&self, port: PortRef) -> Vec<String> {
        let table = self.inner.ports.lock().unwrap();
        let Some(p) = table.ports.get(&port.0) else {
            return Vec::new();
        };
        table
            .connections
            .iter()
            .filter_map(|(a, b)| {
                if a == &p.name {
                    Some(b.clone())
                } else if b == &p.name {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn physically_connected(&self, port: PortRef) -> bool {
        let table = self.inner.ports.lock().unwrap();
        let Some(p) = table.ports.get(&port.0) else {
            return false;
        };
        table.connections.iter().any(|(a, b)| {
            let other = if a == &p.name {
                b
            } else if b == &p.name {
                a
            } else {
                return false;
            };
            table
                .by_name
                .get(other)
                .and_then(|id| table.ports.get(id))
                .map(|o| o.flags.is_physical)
                .unwrap_or(false)
        })
    }

    fn list_ports(
        &self,
        pattern: Option<&str>,
        kind: Option<DataKind>,
        flags: PortFlags,
    ) -> Vec<String> {
        let table = self.inner.ports.lock().unwrap();
        let mut names: Vec<String> = table
            .ports
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind == k))
            .filter(|p| p.flags.matches(flags))
            .filter(|p| pattern.map_or(true, |pat| p.name.contains(pat)))
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }

    fn port_latency_range(&self, port: PortRef, playback: bool) -> LatencyRange {
        let table = self.inner.ports.lock().unwrap();
        table
            .ports
            .get(&port.0)
            .map(|p| {
                if playback {
                    p.playback_latency
                } else {
                    p.capture_latency
                }
            })
            .unwrap_or_default()
    }

    fn set_port_latency_range(&self, port: PortRef, playback: bool, range: LatencyRange) {
        let mut table = self.inner.ports.lock().unwrap();
        if let Some(p) = table.ports.get_mut(&port.0) {
            if playback {
                p.playback_latency = range;
            } else {
                p.capture_latency = range;
            }
        }
    }

    fn recompute_latencies(&self) {
        for events in self.inner.event_handlers() {
            events.latency_changed(false);
            events.latency_changed(true);
        }
    }

    fn audio_buffer(&self, port: PortRef, _nframes: u32) -> Option<NonNull<f32>> {
        let table = self.inner.ports.lock().unwrap();
        table.ports.get(&port.0).map(|p| p.audio.ptr())
    }

    fn midi_event_count(&self, port: PortRef) -> u32 {
        let table = self.inner.ports.lock().unwrap();
        table
            .ports
            .get(&port.0)
            .map(|p| p.midi.lock().unwrap().len() as u32)
            .unwrap_or(0)
    }

    fn midi_event(&self, port: PortRef, index: u32, out: &mut [u8]) -> Option<MidiEventInfo> {
        let table = self.inner.ports.lock().unwrap();
        let p = table.ports.get(&port.0)?;
        let midi = p.midi.lock().unwrap();
        let (time, data) = midi.get(index as usize)?;
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        Some(MidiEventInfo {
            time: *time,
            size: data.len(),
        })
    }

    fn midi_put(&self, port: PortRef, time: u32, data: &[u8]) -> Result<(), ServerError> {
        let table = self.inner.ports.lock().unwrap();
        let p = table.ports.get(&port.0).ok_or(ServerError::UnknownPort)?;
        let mut midi = p.midi.lock().unwrap();
        let used: usize = midi.iter().map(|(_, d)| d.len()).sum();
        if used + data.len() > MIDI_BUFFER_BYTES {
            return Err(ServerError::MidiBufferFull);
        }
        midi.push((time, data.to_vec()));
        Ok(())
    }

    fn midi_clear(&self, port: PortRef) {
        let table = self.inner.ports.lock().unwrap();
        if let Some(p) = table.ports.get(&port.0) {
            p.midi.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reflects_external_control() {
        let ours = DummyServer::new(48000, 1024);
        let outcome = ours.connector().probe("test");
        assert!(!outcome.server_was_running);

        let external = DummyServer::new_external(44100, 512);
        let outcome = external.connector().probe("test");
        assert!(outcome.server_was_running);
        assert_eq!(outcome.sample_rate, 44100);
        assert_eq!(outcome.buffer_size, 512);
    }

    #[test]
    fn name_collision_gets_alternate() {
        let server = DummyServer::new(48000, 1024);
        let connector = server.connector();

        let a = connector.connect("engine").unwrap();
        let b = connector.connect("engine").unwrap();

        assert_eq!(a.client_name(), "engine");
        assert_eq!(b.client_name(), "engine-02");
    }

    #[test]
    fn ports_register_and_connect() {
        let server = DummyServer::new(48000, 1024);
        server.add_system_ports(2, 2);
        let client = server.connector().connect("engine").unwrap();

        let out = client
            .register_port("out_1", DataKind::Audio, PortFlags::output())
            .unwrap();
        let full = client.port_name(out).unwrap();
        assert_eq!(full, "engine:out_1");

        client.connect_ports(&full, "system:playback_1").unwrap();
        assert_eq!(client.port_connections(out), vec!["system:playback_1"]);
        assert!(client.physically_connected(out));

        client.unregister_port(out).unwrap();
        assert!(client.port_by_name(&full).is_none());
    }

    #[test]
    fn list_ports_filters() {
        let server = DummyServer::new(48000, 1024);
        server.add_system_ports(2, 2);
        let client = server.connector().connect("engine").unwrap();

        let physical_inputs =
            client.list_ports(None, Some(DataKind::Audio), PortFlags::input().physical(true));
        assert_eq!(
            physical_inputs,
            vec!["system:playback_1", "system:playback_2"]
        );

        let captures = client.list_ports(Some("capture"), None, PortFlags::default());
        assert_eq!(captures.len(), 2);
    }

    #[test]
    fn midi_round_trip() {
        let server = DummyServer::new(48000, 1024);
        let client = server.connector().connect("engine").unwrap();
        let port = client
            .register_port("midi_in", DataKind::Midi, PortFlags::input())
            .unwrap();

        client.midi_put(port, 3, &[0x90, 60, 100]).unwrap();
        client.midi_put(port, 9, &[0x80, 60, 0]).unwrap();
        assert_eq!(client.midi_event_count(port), 2);

        let mut buf = [0u8; 3];
        let info = client.midi_event(port, 1, &mut buf).unwrap();
        assert_eq!(info.time, 9);
        assert_eq!(info.size, 3);
        assert_eq!(buf, [0x80, 60, 0]);

        client.midi_clear(port);
        assert_eq!(client.midi_event_count(port), 0);
    }
}
