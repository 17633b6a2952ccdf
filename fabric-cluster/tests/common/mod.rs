//! Common test utilities for fabric-cluster tests.

#![allow(dead_code)]

use fabric_cluster::config::ClusterConfigBuilder;
use fabric_cluster::{ClusterConfig, Controller, DecoderRegistry, StartOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Get a free loopback address for testing.
pub async fn get_test_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test port");
    let addr = listener.local_addr().expect("Failed to read test port");
    addr.to_string()
}

/// Builder with timings suited to tests.
pub fn test_config(server_id: &str, addr: &str, data_dir: &Path) -> ClusterConfigBuilder {
    ClusterConfig::builder()
        .node_id(server_id)
        .bind_address(addr)
        .data_dir(data_dir)
        .election_timeout_ms(150, 300)
        .heartbeat_interval_ms(50)
        .dispatch_timeout_ms(5000)
}

/// Start a controller that is expected to run.
pub async fn start(config: ClusterConfig) -> Arc<Controller> {
    Controller::start(config, DecoderRegistry::with_defaults())
        .await
        .expect("Failed to start controller")
        .controller()
        .expect("Controller should be running")
}

/// Start a single-node controller and wait for it to lead.
pub async fn start_single(server_id: &str, data_dir: &Path) -> Arc<Controller> {
    let addr = get_test_addr().await;
    let config = test_config(server_id, &addr, data_dir)
        .build()
        .expect("Invalid config");
    let controller = start(config).await;
    assert!(
        wait_until(Duration::from_secs(5), || controller.is_leader()).await,
        "single node should elect itself"
    );
    controller
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// Test context that holds temp directories and controllers.
pub struct TestCluster {
    /// Temp directories for each node (kept alive for the test duration).
    _temp_dirs: Vec<TempDir>,
    /// Controllers.
    pub nodes: Vec<Arc<Controller>>,
    /// Advertised addresses.
    pub addresses: Vec<String>,
}

impl TestCluster {
    /// Start `node_count` controllers that bootstrap through each other.
    pub async fn new(node_count: usize) -> Self {
        let mut temp_dirs = Vec::with_capacity(node_count);
        let mut addresses = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            temp_dirs.push(TempDir::new().expect("Failed to create temp dir"));
            addresses.push(get_test_addr().await);
        }

        let mut nodes = Vec::with_capacity(node_count);
        for (i, addr) in addresses.iter().enumerate() {
            let others = addresses.iter().filter(|a| *a != addr).cloned();
            let config = test_config(&format!("ctrl-{}", i + 1), addr, temp_dirs[i].path())
                .min_cluster_size(node_count)
                .bootstrap_members(others)
                .build()
                .expect("Invalid config");
            nodes.push(start(config).await);
        }

        Self {
            _temp_dirs: temp_dirs,
            nodes,
            addresses,
        }
    }

    /// Wait until every node agrees on one leader; returns its index.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let mut leader = None;
        wait_until(timeout, || {
            leader = self.agreed_leader();
            leader.is_some()
        })
        .await;
        leader
    }

    fn agreed_leader(&self) -> Option<usize> {
        let index = self.nodes.iter().position(|n| n.is_leader())?;
        let leader_id = self.nodes[index].node_id();
        self.nodes
            .iter()
            .all(|n| n.leader_id() == Some(leader_id))
            .then_some(index)
    }

    /// The current leader.
    pub fn leader(&self) -> &Arc<Controller> {
        let index = self.agreed_leader().expect("No agreed leader");
        &self.nodes[index]
    }

    /// Some node that is not the leader.
    pub fn follower(&self) -> &Arc<Controller> {
        self.nodes
            .iter()
            .find(|n| !n.is_leader())
            .expect("No follower")
    }

    /// Shutdown all nodes.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

/// Start a controller in recovery mode and check that it stops.
pub async fn recover(config: ClusterConfig) {
    let outcome = Controller::start(config, DecoderRegistry::with_defaults())
        .await
        .expect("Recovery should succeed");
    assert!(matches!(outcome, StartOutcome::Recovered));
}
