//! Raft integration module.
//!
//! This module provides the [`Controller`] which ties together:
//! - Log storage ([`LogStore`])
//! - The replicated state machine
//! - The mesh transport and its request handlers
//! - Server identity and membership changes

mod controller;
mod handlers;
mod identity;
mod log;
mod membership;

pub use controller::{Controller, StartOutcome};
pub use identity::{initialize_id, prepare_data_dir, ID_FILE};
pub use log::LogStore;
pub use membership::{JoinRequest, RemoveRequest};
