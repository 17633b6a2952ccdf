//! Trait implementations for OpenRaft integration.

use crate::types::{
    ClusterEntry, ClusterLogId, ClusterSnapshot, ClusterSnapshotMeta, ClusterStorageError,
    ClusterStoredMembership, TypeConfig,
};
use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership};
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::apply::apply_command;
use super::state::ClusterState;
use super::types::{ClusterResponse, StoredSnapshot};
use super::ClusterStateMachine;

/// Builds a consistent snapshot of the current state for log compaction and
/// state transfer to new nodes.
impl RaftSnapshotBuilder<TypeConfig> for Arc<ClusterStateMachine> {
    async fn build_snapshot(&mut self) -> Result<ClusterSnapshot, ClusterStorageError> {
        let state = self.state.read().await;

        let data =
            serde_json::to_vec(&*state).map_err(|e| StorageIOError::read_state_machine(&e))?;

        let last_applied_log = state.last_applied_log;
        let last_membership = state.last_membership.clone();

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match last_applied_log {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx),
            None => format!("--{}", snapshot_idx),
        };

        let meta = ClusterSnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&snapshot)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        tracing::info!(snapshot_id = %meta.snapshot_id, size = data.len(), "snapshot built");
        *current_snapshot = Some(snapshot);

        Ok(ClusterSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// Applies committed log entries to the model store.
///
/// Entries at or below the persisted `last_applied_log` are acknowledged
/// without being applied again, so replay after a crash is harmless.
impl RaftStateMachine<TypeConfig> for Arc<ClusterStateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<ClusterLogId>, ClusterStoredMembership), ClusterStorageError> {
        let state = self.state.read().await;
        Ok((state.last_applied_log, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ClusterResponse>, ClusterStorageError>
    where
        I: IntoIterator<Item = ClusterEntry> + Send,
    {
        self.wait_initialized().await;

        let mut responses = Vec::new();
        let mut state = self.state.write().await;

        for entry in entries {
            if state.has_applied(entry.log_id.index) {
                tracing::debug!(log_id = %entry.log_id, "entry already applied, skipping");
                responses.push(ClusterResponse::ok());
                continue;
            }

            tracing::trace!(log_id = %entry.log_id, "applying to state machine");

            let response = match entry.payload {
                EntryPayload::Blank => ClusterResponse::ok(),
                EntryPayload::Normal(ref command) => {
                    match apply_command(&mut state, &self.registry, command) {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::error!(
                                log_id = %entry.log_id,
                                error = %e,
                                "failed to decode committed command"
                            );
                            return Err(StorageIOError::apply(entry.log_id, &e).into());
                        }
                    }
                }
                EntryPayload::Membership(ref membership) => {
                    state.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    ClusterResponse::ok()
                }
            };

            state.last_applied_log = Some(entry.log_id);
            responses.push(response);
        }

        self.persist_state(&state)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, ClusterStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &ClusterSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), ClusterStorageError> {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            snapshot_size = snapshot.get_ref().len(),
            "installing snapshot"
        );

        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        let mut new_state: ClusterState = serde_json::from_slice(&new_snapshot.data)
            .map_err(|e| StorageIOError::read_snapshot(Some(new_snapshot.meta.signature()), &e))?;
        new_state.last_applied_log = meta.last_log_id;
        new_state.last_membership = meta.last_membership.clone();

        self.persist_snapshot(&new_snapshot)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        self.persist_state(&new_state)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;

        let mut state = self.state.write().await;
        *state = new_state;

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        *current_snapshot = Some(new_snapshot);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<ClusterSnapshot>, ClusterStorageError> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(ClusterSnapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CreateEntity, DecoderRegistry, DeleteEntity};
    use crate::types::{ClusterLogId, EncodedCommand};
    use openraft::CommittedLeaderId;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn log_id(index: u64) -> ClusterLogId {
        ClusterLogId::new(CommittedLeaderId::new(1, 0), index)
    }

    fn entry(index: u64, command: &dyn Command) -> ClusterEntry {
        ClusterEntry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(EncodedCommand(command.encode().expect("encode"))),
        }
    }

    fn ready_machine() -> Arc<ClusterStateMachine> {
        let sm = Arc::new(ClusterStateMachine::new(Arc::new(
            DecoderRegistry::with_defaults(),
        )));
        sm.mark_initialized();
        sm
    }

    #[tokio::test]
    async fn test_apply_waits_for_initialization() {
        let sm = Arc::new(ClusterStateMachine::new(Arc::new(
            DecoderRegistry::with_defaults(),
        )));
        assert!(!sm.is_initialized());

        let mut applier = Arc::clone(&sm);
        let handle = tokio::spawn(async move {
            applier
                .apply(vec![entry(1, &CreateEntity::new("router", "r1", json!({})))])
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(sm.get("router", "r1").await.is_none());

        sm.mark_initialized();
        let responses = handle.await.expect("join").expect("apply");
        assert_eq!(responses.len(), 1);
        assert!(sm.get("router", "r1").await.is_some());
    }

    #[tokio::test]
    async fn test_replayed_entries_are_not_applied_twice() {
        let mut sm = ready_machine();
        let create = entry(1, &CreateEntity::new("router", "r1", json!({})));

        let first = sm.apply(vec![create.clone()]).await.expect("apply");
        assert!(first[0].success);

        // A second create of the same id would be refused if it were applied.
        let replay = sm.apply(vec![create]).await.expect("replay");
        assert_eq!(replay, vec![ClusterResponse::ok()]);
    }

    #[tokio::test]
    async fn test_refusal_is_returned_not_raised() {
        let mut sm = ready_machine();
        let responses = sm
            .apply(vec![entry(1, &DeleteEntity::new("router", "missing"))])
            .await
            .expect("apply");
        assert!(!responses[0].success);

        let (applied, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(applied, Some(log_id(1)));
    }

    #[tokio::test]
    async fn test_undecodable_entry_fails_apply() {
        let mut sm = ready_machine();
        let bad = ClusterEntry {
            log_id: log_id(1),
            payload: EntryPayload::Normal(EncodedCommand(b"{}".to_vec())),
        };
        assert!(sm.apply(vec![bad]).await.is_err());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let registry = Arc::new(DecoderRegistry::with_defaults());

        {
            let mut sm = Arc::new(
                ClusterStateMachine::open(dir.path(), Arc::clone(&registry)).expect("open"),
            );
            sm.mark_initialized();
            sm.apply(vec![
                entry(1, &CreateEntity::new("router", "r1", json!({"v": 1}))),
                entry(2, &CreateEntity::new("router", "r2", json!({"v": 2}))),
            ])
            .await
            .expect("apply");
        }

        let mut sm =
            Arc::new(ClusterStateMachine::open(dir.path(), registry).expect("reopen"));
        let (applied, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(applied, Some(log_id(2)));
        assert_eq!(sm.get("router", "r2").await, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_snapshot_build_and_install() {
        let dir = TempDir::new().expect("temp dir");
        let registry = Arc::new(DecoderRegistry::with_defaults());

        let mut source = Arc::new(
            ClusterStateMachine::open(&dir.path().join("a"), Arc::clone(&registry))
                .expect("open"),
        );
        source.mark_initialized();
        source
            .apply(vec![entry(
                1,
                &CreateEntity::new("service", "s1", json!("x")),
            )])
            .await
            .expect("apply");

        let mut builder = source.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.expect("build");
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(1)));

        let target_dir = dir.path().join("b");
        let mut target = Arc::new(
            ClusterStateMachine::open(&target_dir, Arc::clone(&registry)).expect("open"),
        );
        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .expect("install");
        assert_eq!(target.get("service", "s1").await, Some(json!("x")));

        let mut reopened = Arc::new(ClusterStateMachine::open(&target_dir, registry).expect("reopen"));
        let current = reopened
            .get_current_snapshot()
            .await
            .expect("current")
            .expect("snapshot persisted");
        assert_eq!(current.meta.snapshot_id, snapshot.meta.snapshot_id);
    }
}
