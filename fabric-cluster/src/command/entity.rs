//! Generic model entity commands.

use super::{encode_command, Command};
use crate::error::{ApiError, ClusterError, ClusterResult};
use crate::state::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn require(field: &str, value: &str) -> ClusterResult<()> {
    if value.trim().is_empty() {
        return Err(ClusterError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Insert a new entity. Fails with `ALREADY_EXISTS` if the id is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntity {
    /// Bucket the entity lives in ("router", "service", ...).
    pub entity_type: String,
    /// Entity id within the bucket.
    pub id: String,
    /// Entity body.
    pub data: Value,
}

impl CreateEntity {
    /// Registry tag.
    pub const TYPE: &'static str = "create";

    /// Create the command.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            data,
        }
    }
}

impl Command for CreateEntity {
    fn command_type(&self) -> &'static str {
        Self::TYPE
    }

    fn encode(&self) -> ClusterResult<Vec<u8>> {
        encode_command(Self::TYPE, self)
    }

    fn validate(&self) -> ClusterResult<()> {
        require("entity_type", &self.entity_type)?;
        require("id", &self.id)
    }

    fn apply(&self, tx: &mut Transaction<'_>) -> Result<Option<Value>, ApiError> {
        if tx.contains(&self.entity_type, &self.id) {
            return Err(ApiError::already_exists(&self.entity_type, &self.id));
        }
        tx.put(&self.entity_type, &self.id, self.data.clone());
        Ok(None)
    }
}

/// Replace an existing entity. Fails with `NOT_FOUND` if absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateEntity {
    /// Bucket the entity lives in.
    pub entity_type: String,
    /// Entity id within the bucket.
    pub id: String,
    /// Replacement body.
    pub data: Value,
}

impl UpdateEntity {
    /// Registry tag.
    pub const TYPE: &'static str = "update";

    /// Create the command.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            data,
        }
    }
}

impl Command for UpdateEntity {
    fn command_type(&self) -> &'static str {
        Self::TYPE
    }

    fn encode(&self) -> ClusterResult<Vec<u8>> {
        encode_command(Self::TYPE, self)
    }

    fn validate(&self) -> ClusterResult<()> {
        require("entity_type", &self.entity_type)?;
        require("id", &self.id)
    }

    fn apply(&self, tx: &mut Transaction<'_>) -> Result<Option<Value>, ApiError> {
        if !tx.contains(&self.entity_type, &self.id) {
            return Err(ApiError::not_found(&self.entity_type, &self.id));
        }
        tx.put(&self.entity_type, &self.id, self.data.clone());
        Ok(None)
    }
}

/// Remove an entity. Fails with `NOT_FOUND` if absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteEntity {
    /// Bucket the entity lives in.
    pub entity_type: String,
    /// Entity id within the bucket.
    pub id: String,
}

impl DeleteEntity {
    /// Registry tag.
    pub const TYPE: &'static str = "delete";

    /// Create the command.
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl Command for DeleteEntity {
    fn command_type(&self) -> &'static str {
        Self::TYPE
    }

    fn encode(&self) -> ClusterResult<Vec<u8>> {
        encode_command(Self::TYPE, self)
    }

    fn validate(&self) -> ClusterResult<()> {
        require("entity_type", &self.entity_type)?;
        require("id", &self.id)
    }

    fn apply(&self, tx: &mut Transaction<'_>) -> Result<Option<Value>, ApiError> {
        if !tx.delete(&self.entity_type, &self.id) {
            return Err(ApiError::not_found(&self.entity_type, &self.id));
        }
        Ok(None)
    }
}
