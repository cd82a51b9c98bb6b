//! Error taxonomy shared by every connhub layer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the hub's public API.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// Malformed multiserver address, or a DHT address with a bad tag.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The transport failed to connect or to close a session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("this ConnHub instance is closed, create a new one")]
    Closed,
}

/// Failures reported by a [`Transport`](crate::Transport) or a
/// [`Session`](crate::Session).
///
/// Cloneable so the same cause can be handed to the failing caller and
/// carried in the matching lifecycle event.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session closed")]
    SessionClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// The underlying io error kind, if this is an io failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl HubError {
    /// The wrapped transport error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            HubError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
