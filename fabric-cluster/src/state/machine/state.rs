//! The replicated state and its durable form.

use crate::state::store::ModelStore;
use crate::types::{ClusterLogId, ClusterStoredMembership};
use serde::{Deserialize, Serialize};

/// The cluster state that gets replicated.
///
/// `last_applied_log` is persisted in the same file as the store, so after a
/// restart the log is replayed from exactly the first entry the store has not
/// yet seen.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ClusterState {
    /// The model store.
    pub store: ModelStore,
    /// Last applied log ID.
    pub last_applied_log: Option<ClusterLogId>,
    /// Last membership configuration.
    pub last_membership: ClusterStoredMembership,
}

impl ClusterState {
    /// Whether `index` has already been applied.
    pub fn has_applied(&self, index: u64) -> bool {
        self.last_applied_log
            .map(|last| index <= last.index)
            .unwrap_or(false)
    }
}
