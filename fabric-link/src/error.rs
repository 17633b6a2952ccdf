//! Error types for link operations.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type for link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Errors raised while encoding, decoding or exchanging link frames.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed or out-of-context frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed or out-of-context frame received from a known peer.
    #[error("protocol error from [{peer}]: {reason}")]
    PeerProtocol {
        /// Sender of the offending datagram.
        peer: SocketAddr,
        /// What was wrong with it.
        reason: String,
    },

    /// A read or write deadline expired.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// The operation that was attempted.
        op: &'static str,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Build a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        LinkError::Protocol(reason.into())
    }

    /// Attach the sender address to a protocol error.
    pub fn with_peer(self, peer: SocketAddr) -> Self {
        match self {
            LinkError::Protocol(reason) => LinkError::PeerProtocol { peer, reason },
            other => other,
        }
    }

    /// Whether this error was caused by an invalid frame.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            LinkError::Protocol(_) | LinkError::PeerProtocol { .. }
        )
    }

    /// Whether this error was caused by an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }
}
