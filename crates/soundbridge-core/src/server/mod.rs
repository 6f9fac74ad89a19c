//! Server side of the integration layer
//!
//! - The opaque client API boundary ([`api`])
//! - Connection ownership and lifecycle ([`connection`])
//! - Discovery and startup command construction ([`discovery`])
//! - The in-process dummy server ([`dummy`])

pub mod api;
pub mod connection;
pub mod discovery;
pub mod dummy;
