//! Messaging error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the relay_messaging crate.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The listen address stayed busy for the whole bind budget.
    #[error("Address {addr} in use (gave up after {waited:?})")]
    AddressInUse { addr: SocketAddr, waited: Duration },

    /// No connected peer matches the target identity.
    #[error("No connection to {0}")]
    NoRoute(String),

    /// The connection currently has no transport to write to.
    #[error("Not connected")]
    NotConnected,

    /// The connection has reached its terminal state.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A client URL that cannot be dialled.
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A state machine table or binding is invalid.
    #[error("State machine error: {0}")]
    Fsm(#[from] relay_fsm::FsmError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessagingError {
    /// True for errors reporting that the listen address is taken.
    pub fn is_address_in_use(&self) -> bool {
        match self {
            Self::AddressInUse { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AddrInUse,
            _ => false,
        }
    }
}
