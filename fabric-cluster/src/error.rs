//! Error types for cluster operations.

use crate::types::{ClusterMember, ClusterNodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for OpenRaft Raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<ClusterNodeId, E>;

/// Type alias for OpenRaft RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<ClusterNodeId, ClusterMember, RaftError<E>>;

/// Type alias for client write errors.
pub type ClientWriteError = openraft::error::ClientWriteError<ClusterNodeId, ClusterMember>;

/// Type alias for initialize errors.
pub type InitializeError = openraft::error::InitializeError<ClusterNodeId, ClusterMember>;

/// Error code carried by [`ApiError`] when an entity already exists.
pub const CODE_ALREADY_EXISTS: &str = "ALREADY_EXISTS";

/// Error code carried by [`ApiError`] when an entity is missing.
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";

/// Structured application error.
///
/// Produced by commands when they refuse a mutation. It travels back to the
/// dispatching node as JSON inside an error reply, so a caller sees the same
/// value whether the command was applied locally or on a remote leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional underlying cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ApiError {
    /// Create an error with no cause.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Entity already exists.
    pub fn already_exists(entity_type: &str, id: &str) -> Self {
        Self::new(
            CODE_ALREADY_EXISTS,
            format!("{} with id {} already exists", entity_type, id),
        )
    }

    /// Entity does not exist.
    pub fn not_found(entity_type: &str, id: &str) -> Self {
        Self::new(
            CODE_NOT_FOUND,
            format!("{} with id {} not found", entity_type, id),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Malformed or unexpected message on the mesh.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A deadline expired.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// The operation that was attempted.
        op: &'static str,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// Command rejected before it reached the log.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A committed entry could not be decoded.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Invalid join/remove request or failed bootstrap.
    #[error("membership error: {0}")]
    Membership(String),

    /// Persisted identity conflicts with the configured one.
    #[error("claimed id {supplied} does not match existing id {persisted}")]
    Identity {
        /// Id read from the data directory.
        persisted: String,
        /// Id supplied by configuration.
        supplied: String,
    },

    /// Application error returned by a command.
    #[error("{0}")]
    Api(ApiError),

    /// Raw error string returned by a remote node.
    #[error("remote error: {0}")]
    Remote(String),

    /// No leader is currently known.
    #[error("no leader")]
    NoLeader,

    /// Peer channel could not be opened or was lost.
    #[error("connection to [{addr}] failed: {reason}")]
    Connection {
        /// Remote address.
        addr: String,
        /// What went wrong.
        reason: String,
    },

    /// Raft consensus error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Build a connection error.
    pub fn connection(addr: impl Into<String>, reason: impl fmt::Display) -> Self {
        ClusterError::Connection {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// The structured application error, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClusterError::Api(api) => Some(api),
            _ => None,
        }
    }

    /// Whether this error was caused by an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }
}

impl From<ApiError> for ClusterError {
    fn from(e: ApiError) -> Self {
        ClusterError::Api(e)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl<E: std::error::Error> From<RaftError<E>> for ClusterError {
    fn from(e: RaftError<E>) -> Self {
        ClusterError::Raft(e.to_string())
    }
}
