//! Soundbridge - audio server backend integration layer
//!
//! This library re-exports the server connection, discovery and backend
//! adapter functionality from `soundbridge-core`.

pub use soundbridge_core::backend;
pub use soundbridge_core::config;
pub use soundbridge_core::server;

pub use soundbridge_core::{
    BackendConfig, BackendError, ConnectError, DataKind, DeviceStatus, DummyServer,
    EngineCallbacks, LatencyRange, MidiEventInfo, MusicalTime, PatchbayBackend, PortFlags,
    PortHandle, PortRef, PortRegistry, ProbeOutcome, ProcessControl, SaveEvent, SaveKind,
    ServerApi, ServerConnection, ServerConnector, ServerError, ServerEvents, ServerTransport,
    SessionBridge, SessionHandle, TargetSettings, TransportPosition, TransportState,
};
pub use soundbridge_core::{DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, VERSION};
