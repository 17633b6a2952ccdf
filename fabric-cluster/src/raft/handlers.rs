//! Mesh handlers for requests forwarded from other controllers.

use super::controller::Controller;
use super::membership::{JoinRequest, RemoveRequest};
use crate::error::{ClusterError, ClusterResult};
use crate::mesh::{Channel, Message, ReceiveHandler};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, Mutex};

/// Late-bound reference to the local controller.
///
/// Handlers are bound to the mesh before the controller exists; requests
/// that arrive earlier are answered with an error.
pub(crate) type ControllerSlot = Arc<OnceLock<Weak<Controller>>>;

fn controller(slot: &ControllerSlot) -> ClusterResult<Arc<Controller>> {
    slot.get()
        .and_then(Weak::upgrade)
        .ok_or_else(|| ClusterError::Raft("controller not running".to_string()))
}

async fn respond(channel: &Channel, message: &Message, result: ClusterResult<()>) {
    let reply = match result {
        Ok(()) => message.success_reply(),
        Err(e) => message.error_reply(&e),
    };
    if let Err(e) = channel.send(reply).await {
        tracing::debug!(peer = %channel.peer_id(), error = %e, "failed to send reply");
    }
}

/// Applies commands forwarded by followers.
///
/// Requests are queued and processed by a fixed pool of workers. When the
/// queue is full the request is refused immediately.
pub(crate) struct CommandHandler {
    queue: mpsc::Sender<(Message, Channel)>,
}

impl CommandHandler {
    pub fn spawn(slot: ControllerSlot, max_queue_size: usize, max_workers: usize) -> Self {
        let (queue, rx) = mpsc::channel(max_queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..max_workers.max(1) {
            tokio::spawn(run_worker(worker, Arc::clone(&slot), Arc::clone(&rx)));
        }
        Self { queue }
    }
}

async fn run_worker(
    worker: usize,
    slot: ControllerSlot,
    rx: Arc<Mutex<mpsc::Receiver<(Message, Channel)>>>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some((message, channel)) = next else {
            break;
        };

        let result = match controller(&slot) {
            Ok(controller) => controller.apply_encoded_command(message.body.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::debug!(worker, peer = %channel.peer_id(), error = %e, "forwarded command failed");
        }
        respond(&channel, &message, result).await;
    }
    tracing::trace!(worker, "command worker stopped");
}

#[async_trait]
impl ReceiveHandler for CommandHandler {
    async fn handle(&self, message: Message, channel: Channel) {
        if let Err(e) = self.queue.try_send((message, channel)) {
            let (message, channel) = match e {
                mpsc::error::TrySendError::Full(item) => item,
                mpsc::error::TrySendError::Closed(item) => item,
            };
            tracing::warn!(peer = %channel.peer_id(), "command queue full, refusing request");
            let err = ClusterError::Raft("command queue full".to_string());
            respond(&channel, &message, Err(err)).await;
        }
    }
}

/// Handles join requests from other controllers.
pub(crate) struct JoinHandler {
    slot: ControllerSlot,
}

impl JoinHandler {
    pub fn new(slot: ControllerSlot) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl ReceiveHandler for JoinHandler {
    async fn handle(&self, message: Message, channel: Channel) {
        let result: ClusterResult<()> = async {
            let request: JoinRequest = serde_json::from_slice(&message.body)?;
            tracing::info!(server_id = %request.id, addr = %request.addr, voter = request.is_voter, "join request from peer");
            controller(&self.slot)?.join(request).await
        }
        .await;
        respond(&channel, &message, result).await;
    }
}

/// Handles remove requests from other controllers.
pub(crate) struct RemoveHandler {
    slot: ControllerSlot,
}

impl RemoveHandler {
    pub fn new(slot: ControllerSlot) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl ReceiveHandler for RemoveHandler {
    async fn handle(&self, message: Message, channel: Channel) {
        let result: ClusterResult<()> = async {
            let request: RemoveRequest = serde_json::from_slice(&message.body)?;
            tracing::info!(server_id = %request.id, "remove request from peer");
            controller(&self.slot)?.remove(request).await
        }
        .await;
        respond(&channel, &message, result).await;
    }
}
