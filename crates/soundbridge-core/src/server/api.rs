//! The opaque client-side API of the patchbay server
//!
//! Everything the backend knows about the server goes through three traits:
//! - [`ServerConnector`]: probe for a running server and open a client
//!   connection
//! - [`ServerApi`]: one connected client handle (the opaque pointer of the
//!   C client library, as a trait object)
//! - [`ServerEvents`]: the single dispatch object the backend registers to
//!   receive server callbacks
//!
//! The server's IPC protocol is deliberately out of scope. A production
//! build binds these traits to the real client library; tests and the demo
//! CLI use the in-process [`DummyServer`](crate::server::dummy::DummyServer).

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by the server client library
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("not connected to the patchbay server")]
    NotConnected,

    #[error("server refused the request: {0}")]
    Refused(String),

    #[error("unknown port")]
    UnknownPort,

    #[error("port name already in use: {0}")]
    NameInUse(String),

    #[error("MIDI buffer full")]
    MidiBufferFull,
}

/// Server-native port reference, minted by connector implementations.
///
/// Port identity comparisons must use this value, never the address of a
/// local wrapper: two lookups for the same name may return different
/// wrappers if the remote port was re-registered in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef(pub u64);

/// Data type carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Audio,
    Midi,
}

/// Direction and placement flags of a port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// Port receives data (a playback/input port from the client's view)
    pub is_input: bool,
    /// Port produces data
    pub is_output: bool,
    /// Port corresponds to a hardware terminal
    pub is_physical: bool,
    /// Port is at the end of a signal chain
    pub is_terminal: bool,
}

impl PortFlags {
    pub fn input() -> Self {
        Self {
            is_input: true,
            ..Default::default()
        }
    }

    pub fn output() -> Self {
        Self {
            is_output: true,
            ..Default::default()
        }
    }

    pub fn physical(mut self, yn: bool) -> Self {
        self.is_physical = yn;
        self
    }

    /// True if every flag set in `filter` is also set here.
    ///
    /// An empty filter matches any port.
    pub fn matches(&self, filter: PortFlags) -> bool {
        (!filter.is_input || self.is_input)
            && (!filter.is_output || self.is_output)
            && (!filter.is_physical || self.is_physical)
            && (!filter.is_terminal || self.is_terminal)
    }
}

/// Transport state as reported by the server.
///
/// `NetStarting` is a vendor extension emitted by some server builds; the
/// backend treats it as "not yet valid" and never forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTransport {
    Stopped,
    Rolling,
    Looping,
    Starting,
    NetStarting,
}

/// Transport position structure filled in by the timebase master.
///
/// `has_bbt` is the validity bit for the musical fields; a timebase callback
/// that cannot compute them leaves it unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportPosition {
    pub frame: u64,
    pub has_bbt: bool,
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

/// Flavor of a session save request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// Save current state
    Save,
    /// Save current state, then terminate the client
    SaveAndQuit,
    /// Save as a reusable template
    Template,
}

/// A session save request delivered by the server.
///
/// The client fills `command_line` (the command that would restore this
/// client) or sets `error`, then replies via [`ServerApi::session_reply`].
#[derive(Debug, Clone)]
pub struct SaveEvent {
    pub kind: SaveKind,
    /// Directory the server assigned for this client's session state
    pub session_dir: PathBuf,
    /// Server-assigned unique id for this client
    pub client_uuid: String,
    pub command_line: String,
    pub error: bool,
}

/// Min/max latency of a port, in frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

/// Time and length of one MIDI event in a port buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEventInfo {
    /// Frame offset within the current cycle
    pub time: u32,
    /// Full event length in bytes (may exceed the caller's buffer)
    pub size: usize,
}

/// Result of probing for an already-running server before connecting
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    /// True if some other process already owns a running server
    pub server_was_running: bool,
    /// Sample rate observed during the probe (0 if none was running)
    pub sample_rate: u32,
    /// Buffer size observed during the probe (0 if none was running)
    pub buffer_size: u32,
}

/// Factory for client connections.
///
/// `probe` makes a throwaway connection attempt to find out whether a server
/// is already listening; this decides `in_control` once per
/// [`ServerConnection`](crate::server::connection::ServerConnection) and is
/// injectable for tests.
pub trait ServerConnector: Send + Sync {
    fn probe(&self, client_name: &str) -> ProbeOutcome;

    /// Open a client connection under `client_name`.
    ///
    /// The server may resolve a name collision by assigning an alternate
    /// name; the returned handle reports the assigned name.
    fn connect(&self, client_name: &str) -> Result<Arc<dyn ServerApi>, ServerError>;
}

/// Callbacks delivered by the server on its own control threads.
///
/// One dispatch object receives everything so that the backend can sequence
/// its collaborators (engine, port table, session bridge) in one place.
/// Implementations must be callable from any thread; the realtime-class
/// callbacks (`sync`, `timebase`) must not allocate or block.
pub trait ServerEvents: Send + Sync {
    fn sample_rate_changed(&self, _rate: u32) {}
    fn buffer_size_changed(&self, _frames: u32) {}
    fn xrun(&self) {}
    fn freewheel_changed(&self, _on: bool) {}

    /// Transport sync query; return false to hold the transport back
    fn sync(&self, _state: ServerTransport, _frame: u64) -> bool {
        true
    }

    /// Invoked when this client is the timebase master
    fn timebase(
        &self,
        _state: ServerTransport,
        _nframes: u32,
        _pos: &mut TransportPosition,
        _new_position: bool,
    ) {
    }

    fn session_event(&self, _event: SaveEvent) {}

    fn port_registration(&self, _port: PortRef, _name: &str, _registered: bool) {}
    fn ports_connected(&self, _a: &str, _b: &str, _connected: bool) {}
    fn graph_reordered(&self) {}
    fn latency_changed(&self, _playback: bool) {}
}

/// A connected client handle.
///
/// This is the opaque pointer of the C client library as a trait object.
/// Every method is safe to call from control threads; the subset used on the
/// realtime path (`cycle_wait`, `cycle_signal`, buffer and MIDI accessors,
/// transport queries) does not block on client-side locks.
pub trait ServerApi: Send + Sync {
    /// Name the server assigned to this client (may differ from the
    /// requested name after a collision)
    fn client_name(&self) -> String;

    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> u32;
    fn is_realtime(&self) -> bool;
    fn cpu_load(&self) -> f32;

    /// Scheduling priority granted to this client's realtime threads
    fn real_time_priority(&self) -> i32;

    /// Raw bytes available per port buffer for the given data type
    fn buffer_capacity(&self, kind: DataKind) -> usize;

    /// Request a live buffer size change; completion is reported through
    /// [`ServerEvents::buffer_size_changed`]
    fn set_buffer_size(&self, frames: u32) -> Result<(), ServerError>;

    fn set_freewheel(&self, on: bool) -> Result<(), ServerError>;

    /// Register the callback dispatch object. Must be called before
    /// `activate`.
    fn set_event_handler(&self, handler: Arc<dyn ServerEvents>);

    /// Install the hook invoked when the server dies or shuts down
    /// asynchronously. Runs on an arbitrary server thread.
    fn on_shutdown(&self, hook: Box<dyn Fn(&str) + Send + Sync>);

    /// Provide the entry point for the client's realtime processing thread.
    /// The server creates the thread during `activate` and runs the entry
    /// point on it.
    fn set_process_target(&self, target: Box<dyn FnOnce() + Send>);

    /// Block the calling (process) thread until the next cycle is ready.
    /// Returns the cycle's frame count, or `None` once the handle is dead.
    fn cycle_wait(&self) -> Option<u32>;

    /// Signal cycle completion back to the server
    fn cycle_signal(&self, status: i32);

    fn activate(&self) -> Result<(), ServerError>;
    fn deactivate(&self);

    /// Tear the connection down. Idempotent; after this every other method
    /// degrades to a no-op or an empty result.
    fn close(&self);

    /* transport */

    fn transport_start(&self);
    fn transport_stop(&self);
    fn transport_locate(&self, frame: u64);
    fn transport_query(&self) -> (ServerTransport, TransportPosition);
    fn transport_frame(&self) -> u64;

    /// Claim or release the timebase-master role
    fn set_timebase(&self, enabled: bool) -> Result<(), ServerError>;

    /* session */

    fn session_reply(&self, event: SaveEvent);

    /* ports */

    fn register_port(
        &self,
        name: &str,
        kind: DataKind,
        flags: PortFlags,
    ) -> Result<PortRef, ServerError>;

    fn unregister_port(&self, port: PortRef) -> Result<(), ServerError>;

    fn port_by_name(&self, name: &str) -> Option<PortRef>;
    fn port_name(&self, port: PortRef) -> Option<String>;
    fn port_kind(&self, port: PortRef) -> Option<DataKind>;
    fn port_flags(&self, port: PortRef) -> Option<PortFlags>;

    fn connect_ports(&self, src: &str, dst: &str) -> Result<(), ServerError>;
    fn disconnect_ports(&self, src: &str, dst: &str) -> Result<(), ServerError>;
    fn disconnect_all(&self, port: PortRef) -> Result<(), ServerError>;

    fn port_connections(&self, port: PortRef) -> Vec<String>;
    fn physically_connected(&self, port: PortRef) -> bool;

    /// Names of ports matching a name pattern, data type and flag filter.
    /// All filters are optional; an empty filter matches everything.
    fn list_ports(
        &self,
        pattern: Option<&str>,
        kind: Option<DataKind>,
        flags: PortFlags,
    ) -> Vec<String>;

    fn port_latency_range(&self, port: PortRef, playback: bool) -> LatencyRange;
    fn set_port_latency_range(&self, port: PortRef, playback: bool, range: LatencyRange);
    fn recompute_latencies(&self);

    /// Address of the port's audio buffer for the current cycle.
    ///
    /// Valid for `nframes` samples until the cycle completes. Callers must
    /// not hold the pointer across cycles.
    fn audio_buffer(&self, port: PortRef, nframes: u32) -> Option<NonNull<f32>>;

    /* MIDI, all relative to the port's buffer for the current cycle */

    fn midi_event_count(&self, port: PortRef) -> u32;

    /// Copy event `index` into `out` (truncating if `out` is short) and
    /// return its time and true size
    fn midi_event(&self, port: PortRef, index: u32, out: &mut [u8]) -> Option<MidiEventInfo>;

    fn midi_put(&self, port: PortRef, time: u32, data: &[u8]) -> Result<(), ServerError>;
    fn midi_clear(&self, port: PortRef);
}
