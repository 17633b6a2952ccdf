//! Controller - the main entry point for cluster operations.

use super::handlers::{CommandHandler, ControllerSlot, JoinHandler, RemoveHandler};
use super::identity::{initialize_id, prepare_data_dir};
use super::log::LogStore;
use super::membership::{JoinRequest, PendingMembers, RemoveRequest};
use crate::command::{command_type_of, Command, DecoderRegistry};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult, InitializeError};
use crate::mesh::{content_type, interpret_reply, Bindings, Mesh, Message};
use crate::network::{bind_raft_rpcs, MeshNetwork, RaftSlot};
use crate::state::{ClusterResponse, ClusterStateMachine};
use crate::trace::{EventSink, LogSink, SourceMatcher, ToggleResult, TracePublisher};
use crate::types::{
    raft_node_id, ClusterMember, ClusterMetrics, ClusterNodeId, ClusterRaft, EncodedCommand,
};
use openraft::error::RaftError;
use openraft::{ChangeMembers, Config, Raft, ServerState};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Interval between attempts to reach configured bootstrap members.
const BOOTSTRAP_RETRY: Duration = Duration::from_secs(1);

/// How long a freshly bootstrapped node waits for a leader before adding
/// the non-voters it collected.
const LEADER_WAIT: Duration = Duration::from_secs(30);

/// Result of [`Controller::start`].
pub enum StartOutcome {
    /// The controller is running.
    Running(Arc<Controller>),
    /// Membership was reset to the local node; the process should exit.
    Recovered,
}

impl StartOutcome {
    /// The running controller, if any.
    pub fn controller(self) -> Option<Arc<Controller>> {
        match self {
            StartOutcome::Running(controller) => Some(controller),
            StartOutcome::Recovered => None,
        }
    }
}

/// A controller node.
///
/// Owns the Raft instance, the mesh it replicates over, and the durable
/// state machine. Commands submitted through [`Controller::dispatch`] are
/// applied locally when this node leads and forwarded to the leader
/// otherwise. Membership changes are serialized under a single lock.
pub struct Controller {
    this: Weak<Controller>,
    server_id: String,
    node_id: ClusterNodeId,
    advertise_addr: String,
    config: ClusterConfig,
    mesh: Mesh,
    raft: Arc<ClusterRaft>,
    state_machine: Arc<ClusterStateMachine>,
    log_store: LogStore,
    pending: Mutex<PendingMembers>,
    bootstrapped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    /// Start a controller.
    ///
    /// Creates the data directory, establishes the server id, opens the
    /// log and state machine, and starts the mesh listener. With
    /// `config.recover` set, the membership is reset to this node and
    /// [`StartOutcome::Recovered`] is returned without starting Raft.
    ///
    /// Channel trace events go to the `tracing` log; use
    /// [`Controller::start_with_sink`] to ship them elsewhere.
    pub async fn start(config: ClusterConfig, registry: DecoderRegistry) -> ClusterResult<StartOutcome> {
        Self::start_with_sink(config, registry, Arc::new(LogSink)).await
    }

    /// Start a controller whose channel trace events are delivered to `sink`.
    pub async fn start_with_sink(
        config: ClusterConfig,
        registry: DecoderRegistry,
        sink: Arc<dyn EventSink>,
    ) -> ClusterResult<StartOutcome> {
        config.validate().map_err(ClusterError::Config)?;

        prepare_data_dir(&config.data_dir)?;
        let server_id = initialize_id(&config.data_dir, config.node_id.as_deref())?;
        let node_id = raft_node_id(&server_id);
        let advertise_addr = config.advertise_address().to_string();

        let log_store = LogStore::open(config.data_dir.join("raft"))?;

        let controller_slot = ControllerSlot::default();
        let raft_slot = RaftSlot::default();

        let mut bindings = Bindings::new();
        bindings
            .bind(
                content_type::NEW_LOG_ENTRY,
                CommandHandler::spawn(
                    Arc::clone(&controller_slot),
                    config.command_handler.max_queue_size,
                    config.command_handler.max_workers,
                ),
            )
            .bind(content_type::JOIN_REQUEST, JoinHandler::new(Arc::clone(&controller_slot)))
            .bind(content_type::REMOVE_REQUEST, RemoveHandler::new(Arc::clone(&controller_slot)));
        bind_raft_rpcs(&mut bindings, Arc::clone(&raft_slot));

        let tracer = TracePublisher::spawn(sink, config.trace.queue_size);
        let mesh = Mesh::new(server_id.clone(), advertise_addr.clone(), bindings, Some(tracer));
        mesh.listen(&config.bind_address).await?;

        let state_machine = Arc::new(ClusterStateMachine::open(
            &config.data_dir,
            Arc::new(registry),
        )?);

        if config.recover {
            let log_id = log_store
                .recover_membership(node_id, ClusterMember::new(server_id.clone(), advertise_addr))
                .await?;
            tracing::info!(%server_id, index = log_id.index, "raft configuration reset to only include local node");
            mesh.shutdown();
            return Ok(StartOutcome::Recovered);
        }

        let has_entries = log_store.last_index().await.is_some();

        let raft_config = Config {
            cluster_name: "fabric-controller".to_string(),
            election_timeout_min: config.raft.election_timeout_ms.0,
            election_timeout_max: config.raft.election_timeout_ms.1,
            heartbeat_interval: config.raft.heartbeat_interval_ms,
            max_payload_entries: config.raft.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                config.snapshot.snapshot_threshold,
            ),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        let network = MeshNetwork::new(mesh.clone(), config.connect_timeout(), config.rpc_timeout());
        let raft = Raft::new(
            node_id,
            raft_config,
            network,
            log_store.clone(),
            Arc::clone(&state_machine),
        )
        .await
        .map_err(|e| ClusterError::Raft(format!("failed to create raft: {}", e)))?;
        state_machine.mark_initialized();

        let raft = Arc::new(raft);
        let _ = raft_slot.set(Arc::downgrade(&raft));

        let (shutdown, _) = watch::channel(false);
        let controller = Arc::new_cyclic(|this| Controller {
            this: this.clone(),
            server_id,
            node_id,
            advertise_addr,
            config,
            mesh,
            raft,
            state_machine,
            log_store,
            pending: Mutex::new(PendingMembers::default()),
            bootstrapped: AtomicBool::new(has_entries),
            shutdown,
        });
        let _ = controller_slot.set(Arc::downgrade(&controller));

        tracing::info!(
            server_id = %controller.server_id,
            node_id = controller.node_id,
            addr = %controller.advertise_addr,
            bootstrapped = has_entries,
            "controller started"
        );

        if !has_entries {
            controller
                .join(JoinRequest::voter(
                    controller.server_id.clone(),
                    controller.advertise_addr.clone(),
                ))
                .await?;
            if !controller.is_bootstrapped() {
                controller.spawn_bootstrap_members();
            }
        }

        Ok(StartOutcome::Running(controller))
    }

    /// Validate, then apply `command` through consensus.
    ///
    /// Applies locally when this node is leader, otherwise forwards the
    /// encoded command to the leader and returns its outcome.
    pub async fn dispatch(&self, command: &dyn Command) -> ClusterResult<()> {
        command.validate()?;
        let encoded = command.encode()?;

        if self.is_leader() {
            return self.apply_encoded_command(encoded).await;
        }
        self.forward_to_leader(content_type::NEW_LOG_ENTRY, encoded).await
    }

    /// Apply an already encoded command on this node, which must be leader.
    pub async fn apply_encoded_command(&self, encoded: Vec<u8>) -> ClusterResult<()> {
        let command_type = command_type_of(&encoded);
        let response = self
            .apply_with_timeout(encoded, self.config.dispatch_timeout())
            .await?;
        match response.into_result() {
            Ok(None) => Ok(()),
            Ok(Some(value)) => {
                tracing::error!(
                    command_type = command_type.as_deref().unwrap_or("unknown"),
                    %value,
                    "command returned a value on success, discarding it"
                );
                Ok(())
            }
            Err(api) => Err(ClusterError::Api(api)),
        }
    }

    /// Append `encoded` to the log and wait up to `timeout` for it to apply.
    pub async fn apply_with_timeout(
        &self,
        encoded: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<ClusterResponse> {
        let write = tokio::time::timeout(timeout, self.raft.client_write(EncodedCommand(encoded)))
            .await
            .map_err(|_| ClusterError::Timeout { op: "apply", timeout })?;
        Ok(write?.data)
    }

    /// Ask the cluster to admit a server.
    ///
    /// Before bootstrap, requests are accumulated until the configured
    /// number of voters is known, then the cluster is initialized with them.
    /// Afterwards each request is a live membership change.
    pub async fn join(&self, request: JoinRequest) -> ClusterResult<()> {
        request.validate()?;
        let mut pending = self.pending.lock().await;

        if self.is_bootstrapped() {
            return self.handle_join(request).await;
        }

        tracing::info!(
            server_id = %request.id,
            addr = %request.addr,
            voter = request.is_voter,
            "join request received before bootstrap"
        );
        pending.add(request);

        let voters = pending.voter_count();
        let needed = self.config.bootstrap_threshold();
        if voters < needed {
            tracing::info!(
                voters,
                needed,
                pending = pending.len(),
                "waiting for more voters before bootstrap"
            );
            return Ok(());
        }

        let members = pending.voters();
        let member_list = members.values().map(|m| m.to_string()).collect::<Vec<_>>();
        match self.raft.initialize(members).await {
            Ok(()) => tracing::info!(members = ?member_list, "cluster bootstrapped"),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::info!("cluster already initialized");
            }
            Err(e) => {
                return Err(ClusterError::Membership(format!(
                    "failed to bootstrap cluster: {}",
                    e
                )))
            }
        }
        self.bootstrapped.store(true, Ordering::Release);

        let nonvoters = pending.take_nonvoters();
        if !nonvoters.is_empty() {
            self.spawn_add_nonvoters(nonvoters);
        }
        Ok(())
    }

    /// Remove a server from the cluster.
    pub async fn remove_server(&self, id: impl Into<String>) -> ClusterResult<()> {
        self.remove(RemoveRequest::new(id)).await
    }

    /// Process a remove request.
    pub async fn remove(&self, request: RemoveRequest) -> ClusterResult<()> {
        request.validate()?;
        let _pending = self.pending.lock().await;
        self.handle_remove(request).await
    }

    async fn handle_join(&self, request: JoinRequest) -> ClusterResult<()> {
        if !self.is_leader() {
            let body = serde_json::to_vec(&request)?;
            return self.forward_to_leader(content_type::JOIN_REQUEST, body).await;
        }

        let node_id = raft_node_id(&request.id);
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let is_member = membership.get_node(&node_id).is_some();
        let is_voter = membership.voter_ids().any(|id| id == node_id);

        if is_voter || (is_member && !request.is_voter) {
            tracing::info!(server_id = %request.id, "server is already a member");
            return Ok(());
        }

        if !is_member {
            self.raft
                .add_learner(node_id, request.member(), true)
                .await?;
            tracing::info!(server_id = %request.id, addr = %request.addr, "added non-voting member");
        }

        if request.is_voter {
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), false)
                .await?;
            tracing::info!(server_id = %request.id, "promoted member to voter");
        }
        Ok(())
    }

    async fn handle_remove(&self, request: RemoveRequest) -> ClusterResult<()> {
        if !self.is_leader() {
            let body = serde_json::to_vec(&request)?;
            return self.forward_to_leader(content_type::REMOVE_REQUEST, body).await;
        }

        let node_id = raft_node_id(&request.id);
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let is_voter = membership.voter_ids().any(|id| id == node_id);
        let is_member = membership.get_node(&node_id).is_some();

        let change = if is_voter {
            if membership.voter_ids().all(|id| id == node_id) {
                return Err(ClusterError::Membership(format!(
                    "cannot remove {}, the last voter",
                    request.id
                )));
            }
            ChangeMembers::RemoveVoters(BTreeSet::from([node_id]))
        } else if is_member {
            ChangeMembers::RemoveNodes(BTreeSet::from([node_id]))
        } else {
            return Err(ClusterError::Membership(format!(
                "server {} is not a member",
                request.id
            )));
        };

        self.raft.change_membership(change, false).await?;
        tracing::info!(server_id = %request.id, voter = is_voter, "removed server from cluster");
        Ok(())
    }

    async fn forward_to_leader(&self, kind: i32, body: Vec<u8>) -> ClusterResult<()> {
        let leader_addr = self.leader_addr().ok_or(ClusterError::NoLeader)?;
        tracing::debug!(leader = %leader_addr, content_type = kind, "forwarding to leader");

        let peer = self
            .mesh
            .get_or_connect_peer(&leader_addr, self.config.connect_timeout())
            .await?;
        let reply = peer
            .channel
            .send_for_reply(Message::new(kind, body), self.config.dispatch_timeout())
            .await?;
        interpret_reply(&reply)
    }

    fn spawn_add_nonvoters(&self, nonvoters: Vec<JoinRequest>) {
        let this = self.this.clone();
        let raft = Arc::clone(&self.raft);
        tokio::spawn(async move {
            let leader = raft
                .wait(Some(LEADER_WAIT))
                .metrics(|m| m.current_leader.is_some(), "leader elected")
                .await;
            if let Err(e) = leader {
                tracing::warn!(error = %e, "no leader to add non-voting members to");
                return;
            }
            let Some(controller) = this.upgrade() else {
                return;
            };
            for request in nonvoters {
                let id = request.id.clone();
                if let Err(e) = controller.join(request).await {
                    tracing::warn!(server_id = %id, error = %e, "failed to add non-voting member");
                }
            }
        });
    }

    fn spawn_bootstrap_members(&self) {
        let mut remaining: Vec<String> = self
            .config
            .bootstrap_members
            .iter()
            .filter(|addr| **addr != self.advertise_addr)
            .cloned()
            .collect();
        if remaining.is_empty() {
            return;
        }

        let this = self.this.clone();
        let connect_timeout = self.config.connect_timeout();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let Some(controller) = this.upgrade() else {
                    break;
                };
                if controller.is_bootstrapped() {
                    break;
                }

                let mut unreachable = Vec::new();
                for addr in remaining {
                    let peer = match controller.mesh.get_or_connect_peer(&addr, connect_timeout).await {
                        Ok(peer) => peer,
                        Err(e) => {
                            tracing::debug!(%addr, error = %e, "bootstrap member not reachable yet");
                            unreachable.push(addr);
                            continue;
                        }
                    };
                    match controller.join(JoinRequest::voter(peer.id.clone(), addr.clone())).await {
                        Ok(()) => tracing::info!(server_id = %peer.id, %addr, "bootstrap member joined"),
                        Err(e) => {
                            tracing::warn!(server_id = %peer.id, %addr, error = %e, "bootstrap join failed");
                            unreachable.push(addr);
                        }
                    }
                }
                remaining = unreachable;
                drop(controller);

                if remaining.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(BOOTSTRAP_RETRY) => {}
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                }
            }
        });
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// Raft id of the current leader.
    pub fn leader_id(&self) -> Option<ClusterNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Mesh address of the current leader.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        if leader == self.node_id {
            return Some(self.advertise_addr.clone());
        }
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
            .filter(|addr| !addr.is_empty())
    }

    /// Whether the cluster has been bootstrapped, here or by a peer.
    pub fn is_bootstrapped(&self) -> bool {
        if self.bootstrapped.load(Ordering::Acquire) {
            return true;
        }
        if self.raft.metrics().borrow().last_log_index.is_some() {
            self.bootstrapped.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Persisted server id.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Numeric Raft id.
    pub fn node_id(&self) -> ClusterNodeId {
        self.node_id
    }

    /// Address other members dial.
    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    /// The mesh this controller replicates over.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Read-only view of the replicated state.
    ///
    /// Reads are local and may lag the leader.
    pub fn store(&self) -> &Arc<ClusterStateMachine> {
        &self.state_machine
    }

    /// Durable log storage.
    pub fn log_store(&self) -> &LogStore {
        &self.log_store
    }

    /// Current Raft metrics.
    pub fn metrics(&self) -> ClusterMetrics {
        self.raft.metrics().borrow().clone()
    }

    /// Start tracing mesh channels whose peer id matches.
    pub fn enable_tracing(&self, matcher: &SourceMatcher) -> Vec<ToggleResult> {
        self.mesh.toggle_tracing(matcher, true)
    }

    /// Stop tracing mesh channels whose peer id matches.
    pub fn disable_tracing(&self, matcher: &SourceMatcher) -> Vec<ToggleResult> {
        self.mesh.toggle_tracing(matcher, false)
    }

    /// Stop Raft and close the mesh.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        let result = self
            .raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("shutdown failed: {}", e)));
        self.mesh.shutdown();
        tracing::info!(server_id = %self.server_id, "controller stopped");
        result
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("server_id", &self.server_id)
            .field("node_id", &self.node_id)
            .field("advertise_addr", &self.advertise_addr)
            .finish()
    }
}
