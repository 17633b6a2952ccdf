//! Cluster configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a controller node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Operator-supplied server id. Checked against the persisted id file;
    /// a fresh id is generated when neither exists.
    pub node_id: Option<String>,

    /// Directory holding the id file, Raft log, FSM state and snapshots.
    pub data_dir: PathBuf,

    /// Address the mesh listens on (e.g., "0.0.0.0:6262").
    pub bind_address: String,

    /// Address advertised to other members. Falls back to `bind_address`.
    pub advertise_address: Option<String>,

    /// Number of voter joins to accumulate before bootstrapping.
    pub min_cluster_size: usize,

    /// Mesh addresses of the other initial members.
    pub bootstrap_members: Vec<String>,

    /// Reset membership to only this node, then stop.
    pub recover: bool,

    /// Forwarded command processing.
    pub command_handler: CommandHandlerConfig,

    /// Raft timing configuration.
    pub raft: RaftConfig,

    /// Snapshot configuration.
    pub snapshot: SnapshotConfig,

    /// Request deadlines.
    pub timeouts: TimeoutConfig,

    /// Channel trace publication.
    pub trace: TraceConfig,
}

/// Worker pool settings for forwarded commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandHandlerConfig {
    /// Maximum queued commands before new ones are refused.
    pub max_queue_size: usize,
    /// Number of concurrent workers.
    pub max_workers: usize,
}

/// Raft timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RaftConfig {
    /// Election timeout range (min, max) in milliseconds.
    pub election_timeout_ms: (u64, u64),

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,
}

/// Snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Create snapshot after this many log entries.
    pub snapshot_threshold: u64,
}

/// Deadlines for blocking operations, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Local apply or forwarded dispatch.
    pub dispatch_ms: u64,
    /// Opening a mesh channel.
    pub connect_ms: u64,
    /// A single Raft RPC.
    pub rpc_ms: u64,
}

/// Trace publication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TraceConfig {
    /// Events buffered before new ones are dropped.
    pub queue_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            data_dir: PathBuf::from("./fabric-data"),
            bind_address: "127.0.0.1:6262".to_string(),
            advertise_address: None,
            min_cluster_size: 1,
            bootstrap_members: Vec::new(),
            recover: false,
            command_handler: CommandHandlerConfig::default(),
            raft: RaftConfig::default(),
            snapshot: SnapshotConfig::default(),
            timeouts: TimeoutConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl Default for CommandHandlerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_workers: 10,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
            max_entries_per_append: 100,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 10_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dispatch_ms: 5_000,
            connect_ms: 5_000,
            rpc_ms: 5_000,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { queue_size: 16 }
    }
}

impl ClusterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Get the advertised address (falls back to bind_address).
    pub fn advertise_address(&self) -> &str {
        self.advertise_address
            .as_deref()
            .unwrap_or(&self.bind_address)
    }

    /// Deadline for applying or forwarding a command.
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.dispatch_ms)
    }

    /// Deadline for opening a mesh channel.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    /// Deadline for a single Raft RPC.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.rpc_ms)
    }

    /// Bootstrap threshold. A cluster always needs at least one voter.
    pub fn bootstrap_threshold(&self) -> usize {
        self.min_cluster_size.max(1)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.is_empty() {
            return Err("bind_address is required".to_string());
        }

        if matches!(&self.node_id, Some(id) if id.trim().is_empty()) {
            return Err("node_id must not be blank".to_string());
        }

        if self.command_handler.max_workers == 0 {
            return Err("command_handler.max_workers must be > 0".to_string());
        }

        if self.command_handler.max_queue_size == 0 {
            return Err("command_handler.max_queue_size must be > 0".to_string());
        }

        if self.trace.queue_size == 0 {
            return Err("trace.queue_size must be > 0".to_string());
        }

        let (min_election, max_election) = self.raft.election_timeout_ms;
        if min_election > max_election {
            return Err(format!(
                "election_timeout_ms range is inverted ({} > {})",
                min_election, max_election
            ));
        }

        // Heartbeat should be much less than election timeout
        if self.raft.heartbeat_interval_ms >= min_election / 2 {
            return Err(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min_election
            ));
        }

        Ok(())
    }
}

/// Builder for ClusterConfig.
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the server id.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = Some(id.into());
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the mesh bind address.
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set the advertise address.
    pub fn advertise_address(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_address = Some(addr.into());
        self
    }

    /// Set the bootstrap threshold.
    pub fn min_cluster_size(mut self, size: usize) -> Self {
        self.config.min_cluster_size = size;
        self
    }

    /// Add a bootstrap member address.
    pub fn bootstrap_member(mut self, addr: impl Into<String>) -> Self {
        self.config.bootstrap_members.push(addr.into());
        self
    }

    /// Set all bootstrap members at once.
    pub fn bootstrap_members(mut self, addrs: impl IntoIterator<Item = String>) -> Self {
        self.config.bootstrap_members = addrs.into_iter().collect();
        self
    }

    /// Request a single-node membership reset on start.
    pub fn recover(mut self, recover: bool) -> Self {
        self.config.recover = recover;
        self
    }

    /// Set the forwarded command worker pool.
    pub fn command_handler(mut self, max_queue_size: usize, max_workers: usize) -> Self {
        self.config.command_handler = CommandHandlerConfig {
            max_queue_size,
            max_workers,
        };
        self
    }

    /// Set election timeout range in milliseconds.
    pub fn election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.config.raft.election_timeout_ms = (min, max);
        self
    }

    /// Set heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.raft.heartbeat_interval_ms = ms;
        self
    }

    /// Set snapshot threshold.
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.snapshot.snapshot_threshold = entries;
        self
    }

    /// Set dispatch timeout in milliseconds.
    pub fn dispatch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.dispatch_ms = ms;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ClusterConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
