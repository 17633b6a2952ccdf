//! Raft state machine for the replicated model.
//!
//! The state machine:
//! - Waits until the controller has attached it to Raft before applying
//! - Decodes committed commands through the registry and applies them
//! - Persists the store together with the last applied log id
//! - Supports snapshots for log compaction and state transfer
//!
//! ## Module Structure
//!
//! - `types`: Response and snapshot types
//! - `state`: The replicated ClusterState
//! - `apply`: Command application logic
//! - `traits`: OpenRaft trait implementations

mod apply;
mod state;
mod traits;
mod types;

pub use state::ClusterState;
pub use types::{ClusterResponse, StoredSnapshot};

use crate::command::DecoderRegistry;
use crate::error::ClusterResult;
use crate::persist;
use crate::types::ClusterSnapshotMeta;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

const STATE_FILE: &str = "state.json";
const SNAPSHOT_META_FILE: &str = "current.meta.json";
const SNAPSHOT_DATA_FILE: &str = "current.data";

/// Where the state machine keeps its files.
#[derive(Debug, Clone)]
struct Paths {
    state: PathBuf,
    snapshots: PathBuf,
}

/// The Raft state machine.
///
/// This struct holds the replicated cluster state and provides
/// thread-safe access for reads and applies.
#[derive(Debug)]
pub struct ClusterStateMachine {
    /// The replicated state.
    state: RwLock<ClusterState>,
    /// Decoders for committed commands.
    registry: Arc<DecoderRegistry>,
    /// On-disk location, `None` for a memory-only machine.
    paths: Option<Paths>,
    /// Snapshot index counter.
    snapshot_idx: AtomicU64,
    /// Current snapshot.
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    /// Set once Raft owns this machine.
    initialized: watch::Sender<bool>,
}

impl ClusterStateMachine {
    /// Create a memory-only state machine.
    pub fn new(registry: Arc<DecoderRegistry>) -> Self {
        Self::with_state(registry, None, ClusterState::default(), None)
    }

    /// Open a durable state machine under `data_dir`.
    ///
    /// State lives in `<data_dir>/fsm/state.json`; the latest snapshot in
    /// `<data_dir>/snapshots/`.
    pub fn open(data_dir: &Path, registry: Arc<DecoderRegistry>) -> ClusterResult<Self> {
        let fsm_dir = data_dir.join("fsm");
        let snapshot_dir = data_dir.join("snapshots");
        fs::create_dir_all(&fsm_dir)?;
        fs::create_dir_all(&snapshot_dir)?;

        let paths = Paths {
            state: fsm_dir.join(STATE_FILE),
            snapshots: snapshot_dir,
        };

        let state: ClusterState = persist::read_json(&paths.state)?.unwrap_or_default();
        let snapshot = load_snapshot(&paths.snapshots)?;

        tracing::debug!(
            last_applied = ?state.last_applied_log,
            has_snapshot = snapshot.is_some(),
            "state machine opened"
        );

        Ok(Self::with_state(registry, Some(paths), state, snapshot))
    }

    fn with_state(
        registry: Arc<DecoderRegistry>,
        paths: Option<Paths>,
        state: ClusterState,
        snapshot: Option<StoredSnapshot>,
    ) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            state: RwLock::new(state),
            registry,
            paths,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(snapshot),
            initialized,
        }
    }

    /// Allow entries to be applied.
    pub fn mark_initialized(&self) {
        self.initialized.send_replace(true);
    }

    /// Whether entries may be applied.
    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Block until [`mark_initialized`](Self::mark_initialized) has been called.
    async fn wait_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        // The sender lives in self, so this cannot observe a closed channel.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Decoders used by this machine.
    pub fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.registry
    }

    /// Get a read-only view of the current state.
    ///
    /// Reads are served from the local replica and may lag the leader.
    pub async fn state(&self) -> tokio::sync::RwLockReadGuard<'_, ClusterState> {
        self.state.read().await
    }

    /// Copy of one entity from the local replica.
    pub async fn get(&self, bucket: &str, key: &str) -> Option<Value> {
        self.state.read().await.store.get(bucket, key).cloned()
    }

    fn persist_state(&self, state: &ClusterState) -> std::io::Result<()> {
        match &self.paths {
            Some(paths) => persist::write_json_atomic(&paths.state, state),
            None => Ok(()),
        }
    }

    fn persist_snapshot(&self, snapshot: &StoredSnapshot) -> std::io::Result<()> {
        match &self.paths {
            Some(paths) => {
                persist::write_bytes_atomic(
                    &paths.snapshots.join(SNAPSHOT_DATA_FILE),
                    &snapshot.data,
                )?;
                persist::write_json_atomic(
                    &paths.snapshots.join(SNAPSHOT_META_FILE),
                    &snapshot.meta,
                )
            }
            None => Ok(()),
        }
    }
}

fn load_snapshot(dir: &Path) -> std::io::Result<Option<StoredSnapshot>> {
    let meta: Option<ClusterSnapshotMeta> = persist::read_json(&dir.join(SNAPSHOT_META_FILE))?;
    let Some(meta) = meta else {
        return Ok(None);
    };
    let data = fs::read(dir.join(SNAPSHOT_DATA_FILE))?;
    Ok(Some(StoredSnapshot { meta, data }))
}
