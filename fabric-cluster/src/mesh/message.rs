//! Mesh envelope.
//!
//! Every frame on a mesh channel is one JSON-encoded [`Message`] behind a
//! 4-byte big-endian length prefix. Requests carry a fresh `sequence`;
//! replies echo it in `reply_for`.

use crate::error::{ApiError, ClusterError, ClusterResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Content type discriminators.
pub mod content_type {
    /// Apply an encoded command on the leader.
    pub const NEW_LOG_ENTRY: i32 = 2050;
    /// Request succeeded.
    pub const SUCCESS_RESPONSE: i32 = 2051;
    /// Request failed.
    pub const ERROR_RESPONSE: i32 = 2052;
    /// Join the cluster.
    pub const JOIN_REQUEST: i32 = 2053;
    /// Leave the cluster.
    pub const REMOVE_REQUEST: i32 = 2054;
    /// Raft AppendEntries RPC.
    pub const APPEND_ENTRIES: i32 = 2060;
    /// Raft Vote RPC.
    pub const VOTE: i32 = 2061;
    /// Raft InstallSnapshot RPC.
    pub const INSTALL_SNAPSHOT: i32 = 2062;
    /// Raft RPC reply.
    pub const RAFT_RESPONSE: i32 = 2063;
    /// Identity exchange when a channel opens.
    pub const MESH_HELLO: i32 = 2070;
    /// Published channel trace event.
    pub const TRACE_EVENT: i32 = 2080;
}

/// Header keys.
pub mod header {
    /// Error code on an error reply.
    pub const ERROR_CODE: i32 = 1000;
    /// Sender's server id.
    pub const PEER_ID: i32 = 1001;
    /// Sender's advertised address.
    pub const PEER_ADDR: i32 = 1002;
}

/// Error code marking an error reply body as a JSON [`ApiError`].
pub const ERROR_CODE_API_ERROR: u32 = 1;

/// A request or reply exchanged between mesh peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What the body contains.
    pub content_type: i32,
    /// Assigned by the sending channel.
    pub sequence: u32,
    /// Sequence of the request this replies to.
    pub reply_for: Option<u32>,
    /// Typed side data.
    pub headers: BTreeMap<i32, Vec<u8>>,
    /// Payload.
    pub body: Vec<u8>,
}

impl Message {
    /// Create a request. The sequence is assigned when it is sent.
    pub fn new(content_type: i32, body: Vec<u8>) -> Self {
        Self {
            content_type,
            sequence: 0,
            reply_for: None,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Create a reply to `self`.
    pub fn reply(&self, content_type: i32, body: Vec<u8>) -> Self {
        Self {
            reply_for: Some(self.sequence),
            ..Self::new(content_type, body)
        }
    }

    /// Create a success reply to `self`.
    pub fn success_reply(&self) -> Self {
        self.reply(content_type::SUCCESS_RESPONSE, Vec::new())
    }

    /// Create an error reply to `self`.
    ///
    /// An [`ApiError`] travels as JSON under [`ERROR_CODE_API_ERROR`]; any
    /// other error is sent as its display string.
    pub fn error_reply(&self, error: &ClusterError) -> Self {
        match error.api_error().map(serde_json::to_vec) {
            Some(Ok(body)) => self
                .reply(content_type::ERROR_RESPONSE, body)
                .with_u32_header(header::ERROR_CODE, ERROR_CODE_API_ERROR),
            _ => self.reply(content_type::ERROR_RESPONSE, error.to_string().into_bytes()),
        }
    }

    /// Builder-style header insert.
    pub fn with_header(mut self, key: i32, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value.into());
        self
    }

    /// Builder-style little-endian `u32` header insert.
    pub fn with_u32_header(self, key: i32, value: u32) -> Self {
        self.with_header(key, value.to_le_bytes().to_vec())
    }

    /// Read a UTF-8 header.
    pub fn string_header(&self, key: i32) -> Option<String> {
        self.headers
            .get(&key)
            .and_then(|v| String::from_utf8(v.clone()).ok())
    }

    /// Read a little-endian `u32` header.
    pub fn u32_header(&self, key: i32) -> Option<u32> {
        let bytes: [u8; 4] = self.headers.get(&key)?.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Whether this answers a request.
    pub fn is_reply(&self) -> bool {
        self.reply_for.is_some()
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> ClusterResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from the wire.
    pub fn decode(frame: &[u8]) -> ClusterResult<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| ClusterError::Protocol(format!("malformed mesh message: {}", e)))
    }
}

/// Turn a reply to a request into the request's outcome.
///
/// Success is `Ok`. An error reply becomes the decoded [`ApiError`] when the
/// error code header says so, otherwise the raw body as a remote error. Any
/// other content type is a protocol error.
pub fn interpret_reply(reply: &Message) -> ClusterResult<()> {
    match reply.content_type {
        content_type::SUCCESS_RESPONSE => Ok(()),
        content_type::ERROR_RESPONSE => {
            if reply.u32_header(header::ERROR_CODE) == Some(ERROR_CODE_API_ERROR) {
                let api: ApiError = serde_json::from_slice(&reply.body).map_err(|e| {
                    ClusterError::Protocol(format!("unable to decode api error response: {}", e))
                })?;
                Err(ClusterError::Api(api))
            } else {
                Err(ClusterError::Remote(
                    String::from_utf8_lossy(&reply.body).into_owned(),
                ))
            }
        }
        other => Err(ClusterError::Protocol(format!(
            "unexpected response type {}: {}",
            other,
            String::from_utf8_lossy(&reply.body)
        ))),
    }
}
