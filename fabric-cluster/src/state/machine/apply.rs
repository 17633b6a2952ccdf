//! Command application logic.

use crate::command::DecoderRegistry;
use crate::error::ClusterResult;
use crate::types::EncodedCommand;

use super::state::ClusterState;
use super::types::ClusterResponse;

/// Decode and apply one command.
///
/// Decode failures are returned as errors; command refusals become an error
/// response and leave the store untouched.
pub(super) fn apply_command(
    state: &mut ClusterState,
    registry: &DecoderRegistry,
    encoded: &EncodedCommand,
) -> ClusterResult<ClusterResponse> {
    let command = registry.decode(&encoded.0)?;

    let mut tx = state.store.begin();
    match command.apply(&mut tx) {
        Ok(value) => {
            let writes = tx.commit();
            tracing::trace!(
                command_type = command.command_type(),
                writes,
                "command applied"
            );
            Ok(value.map_or_else(ClusterResponse::ok, ClusterResponse::with_data))
        }
        Err(error) => {
            tracing::debug!(
                command_type = command.command_type(),
                code = %error.code,
                "command refused"
            );
            Ok(ClusterResponse::err(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CreateEntity, DeleteEntity};
    use crate::error::{ClusterError, CODE_NOT_FOUND};
    use serde_json::json;

    fn encoded(command: &dyn Command) -> EncodedCommand {
        EncodedCommand(command.encode().expect("encode"))
    }

    #[test]
    fn test_apply_commits_on_success() {
        let registry = DecoderRegistry::with_defaults();
        let mut state = ClusterState::default();

        let resp = apply_command(
            &mut state,
            &registry,
            &encoded(&CreateEntity::new("router", "r1", json!({}))),
        )
        .expect("apply");
        assert_eq!(resp, ClusterResponse::ok());
        assert!(state.store.contains("router", "r1"));
    }

    #[test]
    fn test_refusal_becomes_error_response() {
        let registry = DecoderRegistry::with_defaults();
        let mut state = ClusterState::default();

        let resp = apply_command(
            &mut state,
            &registry,
            &encoded(&DeleteEntity::new("router", "missing")),
        )
        .expect("apply");
        assert!(!resp.success);
        assert_eq!(
            resp.into_result().expect_err("refused").code,
            CODE_NOT_FOUND
        );
    }

    #[test]
    fn test_undecodable_entry_is_an_error() {
        let registry = DecoderRegistry::with_defaults();
        let mut state = ClusterState::default();

        let err = apply_command(&mut state, &registry, &EncodedCommand(b"garbage".to_vec()))
            .expect_err("decode");
        assert!(matches!(err, ClusterError::Consistency(_)));
        assert!(state.store.is_empty());
    }
}
