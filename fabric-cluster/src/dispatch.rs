//! Command dispatch for the topology layer.

use crate::command::Command;
use crate::error::ClusterResult;
use crate::raft::Controller;
use async_trait::async_trait;
use std::sync::Arc;

/// Submits commands to the replicated model.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Validate and apply `command`, wherever the leader is.
    async fn dispatch(&self, command: &dyn Command) -> ClusterResult<()>;
}

/// [`Dispatcher`] backed by a running [`Controller`].
#[derive(Debug, Clone)]
pub struct RaftDispatcher {
    controller: Arc<Controller>,
}

impl RaftDispatcher {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }
}

#[async_trait]
impl Dispatcher for RaftDispatcher {
    async fn dispatch(&self, command: &dyn Command) -> ClusterResult<()> {
        self.controller.dispatch(command).await
    }
}
