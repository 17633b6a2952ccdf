//! Raft RPC transport over the mesh.
//!
//! Requests and responses are JSON bodies on mesh messages with the raft
//! content types. The response body is the serialized `Result` returned by
//! the remote Raft instance, so remote Raft errors reach the caller intact.

mod client;
mod server;

pub use client::{MeshConnection, MeshNetwork};
pub use server::{bind_raft_rpcs, RaftRpcHandler, RaftSlot};
