//! Replicated model state.
//!
//! The state machine receives committed log entries (encoded commands),
//! decodes them through the [`DecoderRegistry`](crate::command::DecoderRegistry)
//! and applies them transactionally to a bucketed key-value [`ModelStore`].
//! All nodes apply the same commands in the same order, ensuring consistent
//! state.

mod machine;
mod store;

pub use machine::{ClusterResponse, ClusterState, ClusterStateMachine, StoredSnapshot};
pub use store::{ModelStore, Transaction};
