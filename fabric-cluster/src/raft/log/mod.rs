//! Raft log storage with segmented log files.
//!
//! Implements OpenRaft's `RaftLogStorage` on top of NDJSON segment files:
//!
//! - **Append**: writes to the active segment and fsyncs once per batch
//! - **Purge**: deletes segment files that are wholly below the purge point
//! - **Truncate**: deletes later segments and rewrites the one containing the
//!   truncation point
//!
//! ## Storage Layout
//!
//! ```text
//! <data_dir>/raft/
//! ├── meta.json           # last_purged_log_id, committed
//! ├── vote.json           # vote state
//! └── segments/
//!     ├── seg_000000000000.log  # entries 0-999
//!     └── seg_000000001000.log  # entries 1000-1999
//! ```

mod files;
mod segment;

use crate::error::{ClusterError, ClusterResult};
use crate::types::{
    ClusterEntry, ClusterLogId, ClusterMember, ClusterMembership, ClusterNodeId,
    ClusterStorageError, ClusterVote, TypeConfig,
};
use files::LogFiles;
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{CommittedLeaderId, EntryPayload, LogState, RaftLogReader, StorageIOError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistent storage for Raft logs and vote state.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<RwLock<LogFiles>>,
}

impl LogStore {
    /// Create or open log storage in the given directory.
    pub fn open(dir: PathBuf) -> Result<Self, std::io::Error> {
        let files = LogFiles::load(dir)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(files)),
        })
    }

    /// Index of the last entry, present or purged.
    pub async fn last_index(&self) -> Option<u64> {
        self.inner.read().await.last_log_id().map(|id| id.index)
    }

    /// Append a membership entry naming only `member` as voter.
    ///
    /// Used for disaster recovery when a quorum is permanently lost: on the
    /// next start this node elects itself and the rest of the old cluster is
    /// forgotten.
    pub async fn recover_membership(
        &self,
        node_id: ClusterNodeId,
        member: ClusterMember,
    ) -> ClusterResult<ClusterLogId> {
        let mut files = self.inner.write().await;

        let last = files.last_log_id();
        let term = last
            .map(|id| id.leader_id.term)
            .into_iter()
            .chain(files.vote.map(|v| v.leader_id().term))
            .max()
            .unwrap_or(0);
        let index = last.map(|id| id.index + 1).unwrap_or(0);
        let log_id = ClusterLogId::new(CommittedLeaderId::new(term, node_id), index);

        let membership = ClusterMembership::new(
            vec![BTreeSet::from([node_id])],
            BTreeMap::from([(node_id, member)]),
        );
        files
            .append(vec![ClusterEntry {
                log_id,
                payload: EntryPayload::Membership(membership),
            }])
            .map_err(|e| ClusterError::Storage(format!("failed to write recovery entry: {}", e)))?;

        Ok(log_id)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<ClusterEntry>, ClusterStorageError> {
        let files = self.inner.read().await;
        Ok(files.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, ClusterStorageError> {
        let files = self.inner.read().await;
        Ok(LogState {
            last_purged_log_id: files.last_purged,
            last_log_id: files.last_log_id(),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<ClusterLogId>,
    ) -> Result<(), ClusterStorageError> {
        let mut files = self.inner.write().await;
        files.committed = committed;
        files
            .save_meta()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<ClusterLogId>, ClusterStorageError> {
        Ok(self.inner.read().await.committed)
    }

    async fn save_vote(&mut self, vote: &ClusterVote) -> Result<(), ClusterStorageError> {
        let mut files = self.inner.write().await;
        files
            .save_vote(vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<ClusterVote>, ClusterStorageError> {
        Ok(self.inner.read().await.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), ClusterStorageError>
    where
        I: IntoIterator<Item = ClusterEntry>,
    {
        let mut files = self.inner.write().await;
        files
            .append(entries.into_iter().collect())
            .map_err(|e| StorageIOError::write_logs(&e))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        tracing::debug!(%log_id, "truncating log");
        let mut files = self.inner.write().await;
        files
            .truncate_from(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        tracing::debug!(%log_id, "purging log");
        let mut files = self.inner.write().await;
        files
            .purge_upto(log_id)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::Vote;
    use std::fs;
    use tempfile::TempDir;

    fn test_log_id(term: u64, index: u64) -> ClusterLogId {
        ClusterLogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn test_entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<ClusterEntry> {
        range
            .map(|i| ClusterEntry {
                log_id: test_log_id(term, i),
                payload: EntryPayload::Blank,
            })
            .collect()
    }

    /// Appends directly, bypassing the flush callback.
    async fn append_test_entries(store: &LogStore, entries: Vec<ClusterEntry>) {
        store
            .inner
            .write()
            .await
            .append(entries)
            .expect("append should succeed");
    }

    fn segment_count(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join("segments"))
            .expect("read segments dir")
            .count()
    }

    #[tokio::test]
    async fn test_append_and_read_across_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open storage");

        append_test_entries(&store, test_entries(1, 1..=1500)).await;

        let read = store.try_get_log_entries(1..=1500).await.expect("read");
        assert_eq!(read.len(), 1500);
        assert_eq!(segment_count(&dir), 2);
        assert_eq!(store.last_index().await, Some(1500));
    }

    #[tokio::test]
    async fn test_purge_drops_whole_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open storage");

        append_test_entries(&store, test_entries(1, 1..=2500)).await;
        store.purge(test_log_id(1, 1500)).await.expect("purge");

        assert!(store.try_get_log_entries(1..=1500).await.expect("read").is_empty());
        assert_eq!(
            store.try_get_log_entries(1501..=2500).await.expect("read").len(),
            1000
        );
        // Segment 0 is gone; 1000 still holds 1501..=1999.
        assert_eq!(segment_count(&dir), 2);

        let state = store.get_log_state().await.expect("log state");
        assert_eq!(state.last_purged_log_id, Some(test_log_id(1, 1500)));
        assert_eq!(state.last_log_id, Some(test_log_id(1, 2500)));
    }

    #[tokio::test]
    async fn test_truncate_then_append_overwrites() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open storage");

        append_test_entries(&store, test_entries(1, 1..=100)).await;
        store.truncate(test_log_id(1, 50)).await.expect("truncate");
        append_test_entries(&store, test_entries(2, 50..=60)).await;

        drop(store);
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("reopen");
        let read = store.try_get_log_entries(..).await.expect("read");
        assert_eq!(read.len(), 60);
        assert_eq!(read[49].log_id, test_log_id(2, 50));
    }

    #[tokio::test]
    async fn test_entries_persist() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let store = LogStore::open(dir.path().to_path_buf()).expect("open storage");
            append_test_entries(&store, test_entries(1, 1..=100)).await;
        }

        let mut store = LogStore::open(dir.path().to_path_buf()).expect("reopen storage");
        let read = store.try_get_log_entries(1..=100).await.expect("read");
        assert_eq!(read.len(), 100);
    }

    #[tokio::test]
    async fn test_vote_and_committed_persist() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let mut store = LogStore::open(dir.path().to_path_buf()).expect("open storage");
            store.save_vote(&Vote::new(5, 3)).await.expect("save vote");
            store
                .save_committed(Some(test_log_id(5, 9)))
                .await
                .expect("save committed");
        }

        let mut store = LogStore::open(dir.path().to_path_buf()).expect("reopen storage");
        let vote = store
            .read_vote()
            .await
            .expect("read vote")
            .expect("vote should exist");
        assert_eq!(vote.leader_id().term, 5);
        assert_eq!(vote.leader_id().node_id, 3);
        assert_eq!(
            store.read_committed().await.expect("read committed"),
            Some(test_log_id(5, 9))
        );
    }

    #[tokio::test]
    async fn test_recover_membership_appends_single_voter() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = LogStore::open(dir.path().to_path_buf()).expect("open storage");
        append_test_entries(&store, test_entries(3, 0..=4)).await;

        let member = ClusterMember::new("ctrl-a", "127.0.0.1:6262");
        let log_id = store
            .recover_membership(member.node_id(), member.clone())
            .await
            .expect("recover");
        assert_eq!(log_id.index, 5);
        assert_eq!(log_id.leader_id.term, 3);

        let read = store.try_get_log_entries(5..=5).await.expect("read");
        match &read[0].payload {
            EntryPayload::Membership(m) => {
                let voters: Vec<_> = m.voter_ids().collect();
                assert_eq!(voters, vec![member.node_id()]);
                assert_eq!(m.get_node(&member.node_id()), Some(&member));
            }
            other => panic!("expected membership entry, got {:?}", other),
        }
    }
}
