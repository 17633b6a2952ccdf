//! Discriminator-keyed command decoders.

use super::{Command, CommandEnvelope, CreateEntity, DeleteEntity, UpdateEntity};
use crate::error::{ClusterError, ClusterResult};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

type DecodeFn = Box<dyn Fn(serde_json::Value) -> ClusterResult<Box<dyn Command>> + Send + Sync>;

/// Maps a command type tag to the function that decodes it.
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl DecoderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the entity create/update/delete commands.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<CreateEntity>(CreateEntity::TYPE);
        registry.register::<UpdateEntity>(UpdateEntity::TYPE);
        registry.register::<DeleteEntity>(DeleteEntity::TYPE);
        registry
    }

    /// Register `T` as the decoder for `command_type`.
    ///
    /// A later registration for the same tag replaces the earlier one.
    pub fn register<T>(&mut self, command_type: &str)
    where
        T: Command + DeserializeOwned + 'static,
    {
        let decode: DecodeFn = Box::new(|data| {
            let command: T = serde_json::from_value(data)?;
            Ok(Box::new(command) as Box<dyn Command>)
        });
        self.decoders.insert(command_type.to_string(), decode);
    }

    /// Whether a decoder exists for `command_type`.
    pub fn contains(&self, command_type: &str) -> bool {
        self.decoders.contains_key(command_type)
    }

    /// Decode a command from its log representation.
    ///
    /// Any failure is a [`ClusterError::Consistency`]: the bytes were produced
    /// by a node that could encode them, so this node cannot agree with it.
    pub fn decode(&self, encoded: &[u8]) -> ClusterResult<Box<dyn Command>> {
        let envelope: CommandEnvelope = serde_json::from_slice(encoded)
            .map_err(|e| ClusterError::Consistency(format!("malformed command envelope: {}", e)))?;

        let decode = self.decoders.get(&envelope.command_type).ok_or_else(|| {
            ClusterError::Consistency(format!(
                "no decoder registered for command type '{}'",
                envelope.command_type
            ))
        })?;

        decode(envelope.data).map_err(|e| {
            ClusterError::Consistency(format!(
                "unable to decode '{}' command: {}",
                envelope.command_type, e
            ))
        })
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("DecoderRegistry")
            .field("types", &types)
            .finish()
    }
}
