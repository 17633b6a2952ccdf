//! Replicated controller state for the fabric control plane.
//!
//! Controllers form a Raft group (via OpenRaft) over a peer-to-peer mesh of
//! framed TCP channels. Topology changes are submitted as commands, agreed
//! on through the replicated log, and applied to a durable model store on
//! every controller.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Controller                            │
//! │                                                           │
//! │  dispatch ──► leader? ──yes──► Raft log ──► ClusterState- │
//! │                 │                             Machine     │
//! │                 no                              │         │
//! │                 ▼                               ▼         │
//! │  Mesh ──► NEW_LOG_ENTRY to leader          ModelStore     │
//! │   ▲                                       (fsm/state.json)│
//! │   └── Raft RPCs, join, remove, hello                      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fabric_cluster::{ClusterConfig, Controller, CreateEntity, DecoderRegistry};
//!
//! let config = ClusterConfig::builder()
//!     .data_dir("/var/lib/fabric")
//!     .bind_address("10.0.0.1:6262")
//!     .min_cluster_size(3)
//!     .bootstrap_members(vec!["10.0.0.2:6262".into(), "10.0.0.3:6262".into()])
//!     .build()?;
//!
//! let controller = Controller::start(config, DecoderRegistry::with_defaults())
//!     .await?
//!     .controller()
//!     .expect("not recovering");
//!
//! controller
//!     .dispatch(&CreateEntity::new("services", "svc-1", json!({"name": "web"})))
//!     .await?;
//! ```

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mesh;
pub mod network;
pub mod persist;
pub mod raft;
pub mod state;
pub mod trace;
pub mod types;

// Re-export main types
pub use command::{Command, CreateEntity, DecoderRegistry, DeleteEntity, UpdateEntity};
pub use config::ClusterConfig;
pub use dispatch::{Dispatcher, RaftDispatcher};
pub use error::{ApiError, ClusterError, ClusterResult};
pub use mesh::Mesh;
pub use raft::{Controller, JoinRequest, RemoveRequest, StartOutcome};
pub use state::{ClusterResponse, ClusterStateMachine};
pub use trace::{ChannelSink, EventSink, SourceMatcher};
pub use types::{ClusterMember, ClusterNodeId, TypeConfig};
