//! Backend side of the integration layer
//!
//! - Generic engine contract ([`engine`])
//! - The backend adapter itself ([`adapter`])
//! - Copy-on-write port table and port engine surface ([`ports`])
//! - Session save/timebase bridging ([`session`])
//! - Realtime scheduling helpers ([`rt`])

pub mod adapter;
pub mod engine;
pub mod ports;
pub mod rt;
pub mod session;

use thiserror::Error;

use crate::server::api::ServerError;
use crate::server::connection::ConnectError;

/// Errors surfaced by the backend adapter and port engine
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend is not connected")]
    NotConnected,

    /// A live change the server forbids; the stored value is unchanged
    #[error("cannot change {0} while the server is running")]
    NotWhileRunning(&'static str),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("could not re-establish ports: {0}")]
    PortSetup(String),

    #[error("could not create process thread: {0}")]
    Thread(String),
}
