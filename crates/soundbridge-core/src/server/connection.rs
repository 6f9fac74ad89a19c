//! Ownership of the server client handle
//!
//! `ServerConnection` is the only component that creates or destroys the
//! connection to the patchbay server. It exposes the handle as an atomically
//! swappable nullable reference so the realtime thread can check liveness
//! with a single atomic load, and it guarantees that the Disconnected
//! notification fires exactly once per connection even when an explicit
//! `close()` races an asynchronous server shutdown.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use thiserror::Error;

use crate::server::api::{ProbeOutcome, ServerApi, ServerConnector, ServerError};

/// How long `close()` lingers so a server we started can exit with us
const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// Errors from opening or closing the connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("could not reach the patchbay server: {0}")]
    Unreachable(#[from] ServerError),

    #[error("not connected")]
    NotConnected,
}

type ConnectedHook = Box<dyn Fn() + Send + Sync>;
type DisconnectedHook = Box<dyn Fn(&str) + Send + Sync>;

/// Owns the single opaque handle to the running server connection
pub struct ServerConnection {
    connector: Box<dyn ServerConnector>,
    client_name: String,
    /// The nullable handle; the extra `Arc` level keeps the stored value
    /// sized so the swap stays a single pointer-width atomic
    handle: ArcSwapOption<Arc<dyn ServerApi>>,
    probe: ProbeOutcome,
    on_connected: Mutex<Vec<ConnectedHook>>,
    on_disconnected: Mutex<Vec<DisconnectedHook>>,
}

impl ServerConnection {
    /// Probe for an existing server and prepare a connection under
    /// `client_name`.
    ///
    /// The probe result is fixed for the lifetime of this connection; tests
    /// inject either answer through the connector.
    pub fn new(connector: Box<dyn ServerConnector>, client_name: &str) -> Arc<Self> {
        let probe = connector.probe(client_name);
        if probe.server_was_running {
            tracing::info!(
                sample_rate = probe.sample_rate,
                buffer_size = probe.buffer_size,
                "found an externally managed patchbay server"
            );
        }
        Arc::new(Self {
            connector,
            client_name: client_name.to_string(),
            handle: ArcSwapOption::empty(),
            probe,
            on_connected: Mutex::new(Vec::new()),
            on_disconnected: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the Connected notification (fired synchronously on the
    /// thread calling `open`)
    pub fn on_connected(&self, hook: ConnectedHook) {
        self.on_connected.lock().unwrap().push(hook);
    }

    /// Subscribe to the Disconnected notification.
    ///
    /// The reason string is empty for an orderly `close()` and carries the
    /// server's message for an asynchronous shutdown. Hooks may run on an
    /// arbitrary server thread and must not block.
    pub fn on_disconnected(&self, hook: DisconnectedHook) {
        self.on_disconnected.lock().unwrap().push(hook);
    }

    /// True if this process, not a pre-existing server instance, is
    /// responsible for the server's lifecycle
    pub fn in_control(&self) -> bool {
        !self.probe.server_was_running
    }

    /// Sample rate observed while probing an externally managed server
    pub fn probed_sample_rate(&self) -> u32 {
        self.probe.sample_rate
    }

    /// Buffer size observed while probing an externally managed server
    pub fn probed_buffer_size(&self) -> u32 {
        self.probe.buffer_size
    }

    /// Requested client name (the server may have assigned another; ask the
    /// handle)
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Current handle, or `None` while disconnected.
    ///
    /// A single atomic load; safe from the realtime thread. Callers must
    /// tolerate the handle dying between this load and use.
    pub fn handle(&self) -> Option<Arc<dyn ServerApi>> {
        self.handle.load_full().map(|h| Arc::clone(&*h))
    }

    pub fn connected(&self) -> bool {
        self.handle.load().is_some()
    }

    /// Open the connection.
    ///
    /// Idempotent: an existing connection is closed first. On success the
    /// handle is published and Connected fires before this returns; on
    /// failure the handle stays null and nothing fires.
    pub fn open(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.connected() {
            let _ = self.close();
        }

        let client = self.connector.connect(&self.client_name)?;

        let assigned = client.client_name();
        if assigned != self.client_name {
            // Accept the server's collision resolution silently
            tracing::debug!(requested = %self.client_name, assigned = %assigned, "server assigned an alternate client name");
        }

        self.handle.store(Some(Arc::new(Arc::clone(&client))));

        // The hook must only null the handle and notify; it can run on a
        // thread with unknown scheduling class.
        let weak = Arc::downgrade(self);
        client.on_shutdown(Box::new(move |reason| {
            if let Some(conn) = weak.upgrade() {
                conn.halted_by_server(reason);
            }
        }));

        tracing::info!(client = %assigned, "connected to the patchbay server");
        for hook in self.on_connected.lock().unwrap().iter() {
            hook();
        }
        Ok(())
    }

    /// Close the connection.
    ///
    /// Fires Disconnected with an empty reason, then waits a short grace
    /// period so a server process this connection started can also exit.
    pub fn close(&self) -> Result<(), ConnectError> {
        let Some(client) = self.handle.swap(None) else {
            return Err(ConnectError::NotConnected);
        };

        client.deactivate();
        client.close();
        self.notify_disconnected("");

        std::thread::sleep(CLOSE_GRACE_PERIOD);
        tracing::info!("disconnected from the patchbay server");
        Ok(())
    }

    fn halted_by_server(&self, reason: &str) {
        // Whichever of close() and this hook swaps out the non-null handle
        // gets to notify; the loser observes null and no-ops.
        if self.handle.swap(None).is_some() {
            self.notify_disconnected(reason);
        }
    }

    fn notify_disconnected(&self, reason: &str) {
        for hook in self.on_disconnected.lock().unwrap().iter() {
            hook(reason);
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some(client) = self.handle.swap(None) {
            client.deactivate();
            client.close();
        }
    }
}
