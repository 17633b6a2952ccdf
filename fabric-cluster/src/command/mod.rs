//! Commands replicated through the Raft log.
//!
//! A command is validated before it is submitted, encoded as a tagged JSON
//! envelope (`{"type": ..., "data": ...}`), appended to the log, and decoded
//! again on every node through a [`DecoderRegistry`] before it is applied to
//! the model store.

mod entity;
mod registry;

pub use entity::{CreateEntity, DeleteEntity, UpdateEntity};
pub use registry::DecoderRegistry;

use crate::error::{ApiError, ClusterResult};
use crate::state::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A mutation of the replicated model.
pub trait Command: fmt::Debug + Send + Sync {
    /// Discriminator the registry decodes by.
    fn command_type(&self) -> &'static str;

    /// Encode into the log representation.
    fn encode(&self) -> ClusterResult<Vec<u8>>;

    /// Pre-dispatch check. A failure keeps the command out of the log.
    fn validate(&self) -> ClusterResult<()> {
        Ok(())
    }

    /// Apply to the store.
    ///
    /// Returning `Err` rolls the transaction back. Returning a value is
    /// allowed but reported as an anomaly by the dispatch path.
    fn apply(&self, tx: &mut Transaction<'_>) -> Result<Option<serde_json::Value>, ApiError>;
}

/// Encoded form of every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Discriminator.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command body.
    pub data: serde_json::Value,
}

/// Encode `data` under the `command_type` tag.
pub fn encode_command<T: Serialize + ?Sized>(
    command_type: &str,
    data: &T,
) -> ClusterResult<Vec<u8>> {
    let envelope = CommandEnvelope {
        command_type: command_type.to_string(),
        data: serde_json::to_value(data)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// The type tag of an encoded command, if it has one.
pub fn command_type_of(encoded: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        command_type: String,
    }

    serde_json::from_slice::<Tag>(encoded)
        .ok()
        .map(|tag| tag.command_type)
}
