//! Types for cluster state management.

use crate::error::ApiError;
use crate::types::ClusterSnapshotMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response from applying a command to the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClusterResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Application error if the command refused the mutation.
    pub error: Option<ApiError>,
    /// Value returned by the command, if any.
    pub data: Option<Value>,
}

impl ClusterResponse {
    /// Create a success response.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    /// Create an error response.
    pub fn err(error: ApiError) -> Self {
        Self {
            success: false,
            error: Some(error),
            data: None,
        }
    }

    /// Create a success response with data.
    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    /// Split into the command's outcome.
    pub fn into_result(self) -> Result<Option<Value>, ApiError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Stored snapshot data.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    /// Snapshot metadata.
    pub meta: ClusterSnapshotMeta,
    /// Serialized state data.
    pub data: Vec<u8>,
}
