//! Network client implementing OpenRaft's RaftNetwork trait on the mesh.

use crate::error::{ClusterError, RPCError, RaftError};
use crate::mesh::{content_type, interpret_reply, Mesh, Message};
use crate::types::{ClusterMember, ClusterNodeId, TypeConfig};
use openraft::error::{InstallSnapshotError, NetworkError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Factory for connections to other nodes, sharing the controller's mesh.
#[derive(Clone)]
pub struct MeshNetwork {
    mesh: Mesh,
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl MeshNetwork {
    pub fn new(mesh: Mesh, connect_timeout: Duration, rpc_timeout: Duration) -> Self {
        Self {
            mesh,
            connect_timeout,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for MeshNetwork {
    type Network = MeshConnection;

    async fn new_client(&mut self, target: ClusterNodeId, node: &ClusterMember) -> Self::Network {
        MeshConnection {
            target,
            addr: node.addr.clone(),
            network: self.clone(),
        }
    }
}

/// A connection to a specific node.
pub struct MeshConnection {
    target: ClusterNodeId,
    addr: String,
    network: MeshNetwork,
}

impl MeshConnection {
    async fn call<Req, Resp, E>(
        &self,
        kind: i32,
        req: &Req,
        option: &RPCOption,
    ) -> Result<Resp, RPCError<E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let body = serde_json::to_vec(req).map_err(|e| to_network_error(&ClusterError::from(e)))?;

        let peer = self
            .network
            .mesh
            .get_or_connect_peer(&self.addr, self.network.connect_timeout)
            .await
            .map_err(|e| to_unreachable_error(&e))?;

        let timeout = option.hard_ttl().min(self.network.rpc_timeout);
        let reply = peer
            .channel
            .send_for_reply(Message::new(kind, body), timeout)
            .await
            .map_err(|e| match e {
                ClusterError::Connection { .. } => to_unreachable_error(&e),
                other => to_network_error(&other),
            })?;

        if reply.content_type != content_type::RAFT_RESPONSE {
            let err = match interpret_reply(&reply) {
                Err(e) => e,
                Ok(()) => ClusterError::Protocol("empty raft response".to_string()),
            };
            return Err(to_network_error(&err));
        }

        let result: Result<Resp, RaftError<E>> = serde_json::from_slice(&reply.body)
            .map_err(|e| to_network_error(&ClusterError::from(e)))?;
        result.map_err(|e| openraft::error::RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for MeshConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<ClusterNodeId>, RPCError> {
        self.call(content_type::APPEND_ENTRIES, &req, &option).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<InstallSnapshotResponse<ClusterNodeId>, RPCError<InstallSnapshotError>> {
        self.call(content_type::INSTALL_SNAPSHOT, &req, &option).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<ClusterNodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<ClusterNodeId>, RPCError> {
        self.call(content_type::VOTE, &req, &option).await
    }
}

fn to_network_error<E: std::error::Error>(err: &ClusterError) -> RPCError<E> {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn to_unreachable_error<E: std::error::Error>(err: &ClusterError) -> RPCError<E> {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}
