//! Soundbridge Core - patchbay server connection, discovery and backend
//!
//! This library binds a realtime audio engine's generic backend and port
//! engine contracts to an external patchbay audio server: process lifecycle,
//! buffer/sample-rate negotiation, port registration and connection,
//! realtime callback dispatch, and recovery after server failure.

pub mod backend;
pub mod config;
pub mod server;

pub use backend::adapter::{DeviceStatus, PatchbayBackend, TargetSettings};
pub use backend::engine::{EngineCallbacks, ProcessControl, TransportState};
pub use backend::ports::{PortHandle, PortRegistry};
pub use backend::session::{MusicalTime, SessionBridge, SessionHandle};
pub use backend::BackendError;
pub use config::BackendConfig;
pub use server::api::{
    DataKind, LatencyRange, MidiEventInfo, PortFlags, PortRef, ProbeOutcome, SaveEvent, SaveKind,
    ServerApi, ServerConnector, ServerError, ServerEvents, ServerTransport, TransportPosition,
};
pub use server::connection::{ConnectError, ServerConnection};
pub use server::dummy::DummyServer;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate when nothing else was configured
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default period size when nothing else was configured
pub const DEFAULT_BUFFER_SIZE: u32 = 1024;
