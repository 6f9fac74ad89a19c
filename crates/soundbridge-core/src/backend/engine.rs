//! Contract of the generic audio engine this backend notifies
//!
//! The engine is an external collaborator: the backend translates server
//! events into these calls and never knows anything else about it. Methods
//! invoked on the realtime path (`process`, `sync`) must not allocate or
//! block.

/// Transport state as understood by the generic engine.
///
/// Vendor-extension server states have no counterpart here; the backend
/// filters them before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Rolling,
    Looping,
    Starting,
}

/// Verdict of one processing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessControl {
    /// Signal completion and wait for the next cycle
    Continue,
    /// Leave the process loop; no completion is signalled
    Stop,
}

/// Notifications and queries the generic engine receives from the backend.
///
/// Default implementations are no-ops so test engines implement only what
/// they observe.
pub trait EngineCallbacks: Send + Sync {
    /// Called once on each realtime thread before it starts processing
    fn thread_init(&self) {}

    /// Re-create the engine's ports after (re-)connecting. Buffer sizes and
    /// sample rate are guaranteed to be pushed into the engine first.
    /// Failure aborts the start attempt.
    fn reestablish_ports(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Restore the saved connections between the engine's ports
    fn reconnect_ports(&self) {}

    fn sample_rate_changed(&self, _rate: u32) {}
    fn buffer_size_changed(&self, _frames: u32) {}

    /// One cycle of audio is ready; `frames` is the cycle length
    fn process(&self, _frames: u32) -> ProcessControl {
        ProcessControl::Continue
    }

    /// Transport sync query; return false to ask the server to wait
    fn sync(&self, _state: TransportState, _frame: u64) -> bool {
        true
    }

    fn xrun(&self) {}
    fn freewheel_changed(&self, _on: bool) {}

    /// The backend stopped processing unexpectedly; `reason` comes from the
    /// server and may be empty
    fn halted(&self, _reason: &str) {}

    /// Port latencies changed for the capture (`false`) or playback
    /// (`true`) direction
    fn latency_updated(&self, _playback: bool) {}

    /// The set of ports visible on the server changed
    fn ports_changed(&self) {}

    /// The server's processing graph was re-ordered
    fn graph_reordered(&self) {}

    /// A connection between two ports was made or broken
    fn connection_changed(&self, _a: &str, _b: &str, _connected: bool) {}
}
