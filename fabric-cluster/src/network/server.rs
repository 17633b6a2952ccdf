//! Mesh handlers for inbound Raft RPCs.

use crate::error::{ClusterError, ClusterResult};
use crate::mesh::{content_type, Bindings, Channel, Message, ReceiveHandler};
use crate::types::{ClusterNodeId, ClusterRaft, TypeConfig};
use async_trait::async_trait;
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use std::sync::{Arc, OnceLock, Weak};

/// Late-bound reference to the local Raft instance.
///
/// The mesh must be listening before Raft can be constructed, so the
/// handlers are bound first and the slot is filled once Raft exists.
pub type RaftSlot = Arc<OnceLock<Weak<ClusterRaft>>>;

/// Serves append-entries, vote and install-snapshot requests.
#[derive(Clone)]
pub struct RaftRpcHandler {
    raft: RaftSlot,
}

impl RaftRpcHandler {
    pub fn new(raft: RaftSlot) -> Self {
        Self { raft }
    }

    async fn serve(&self, message: &Message) -> ClusterResult<Vec<u8>> {
        let raft = self
            .raft
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ClusterError::Raft("raft not running".to_string()))?;

        let body = match message.content_type {
            content_type::APPEND_ENTRIES => {
                let req: AppendEntriesRequest<TypeConfig> = serde_json::from_slice(&message.body)?;
                serde_json::to_vec(&raft.append_entries(req).await)?
            }
            content_type::VOTE => {
                let req: VoteRequest<ClusterNodeId> = serde_json::from_slice(&message.body)?;
                serde_json::to_vec(&raft.vote(req).await)?
            }
            content_type::INSTALL_SNAPSHOT => {
                let req: InstallSnapshotRequest<TypeConfig> =
                    serde_json::from_slice(&message.body)?;
                serde_json::to_vec(&raft.install_snapshot(req).await)?
            }
            other => {
                return Err(ClusterError::Protocol(format!(
                    "content type {} is not a raft rpc",
                    other
                )))
            }
        };
        Ok(body)
    }
}

#[async_trait]
impl ReceiveHandler for RaftRpcHandler {
    async fn handle(&self, message: Message, channel: Channel) {
        let reply = match self.serve(&message).await {
            Ok(body) => message.reply(content_type::RAFT_RESPONSE, body),
            Err(e) => {
                tracing::debug!(
                    peer = %channel.peer_id(),
                    content_type = message.content_type,
                    error = %e,
                    "raft rpc failed"
                );
                message.error_reply(&e)
            }
        };
        if let Err(e) = channel.send(reply).await {
            tracing::debug!(peer = %channel.peer_id(), error = %e, "failed to send raft reply");
        }
    }
}

/// Bind the Raft RPC content types to a handler reading from `raft`.
pub fn bind_raft_rpcs(bindings: &mut Bindings, raft: RaftSlot) {
    let handler: Arc<dyn ReceiveHandler> = Arc::new(RaftRpcHandler::new(raft));
    bindings
        .bind_shared(content_type::APPEND_ENTRIES, Arc::clone(&handler))
        .bind_shared(content_type::VOTE, Arc::clone(&handler))
        .bind_shared(content_type::INSTALL_SNAPSHOT, handler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{interpret_reply, Mesh};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unset_slot_replies_with_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let mut bindings = Bindings::new();
        bind_raft_rpcs(&mut bindings, RaftSlot::default());
        let server = Mesh::new("ctrl-b", addr.clone(), bindings, None);
        server.listen(&addr).await.expect("listen");

        let client = Mesh::new("ctrl-a", "127.0.0.1:1", Bindings::new(), None);
        let peer = client
            .get_or_connect_peer(&addr, Duration::from_secs(2))
            .await
            .expect("connect");
        let reply = peer
            .channel
            .send_for_reply(
                Message::new(content_type::VOTE, b"{}".to_vec()),
                Duration::from_secs(2),
            )
            .await
            .expect("reply");
        let err = interpret_reply(&reply).expect_err("no raft");
        assert!(err.to_string().contains("raft not running"));

        server.shutdown();
        client.shutdown();
    }
}
