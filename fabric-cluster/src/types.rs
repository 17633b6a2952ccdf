//! Type definitions for OpenRaft integration.
//!
//! OpenRaft requires a type configuration that specifies all the concrete types
//! used in the Raft implementation. Log entries carry opaque encoded commands;
//! cluster members carry the string server id alongside their mesh address.

use crate::state::ClusterResponse;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Cursor;

/// Node ID type for the cluster.
///
/// Derived from the persisted string server id with [`raft_node_id`].
pub type ClusterNodeId = u64;

/// An encoded command as stored in the replicated log.
///
/// Commands are JSON text, so they serialize as a string in log segments
/// and Raft RPCs. Bytes that are not UTF-8 fall back to a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand(pub Vec<u8>);

impl Serialize for EncodedCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for EncodedCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EncodedVisitor;

        impl<'de> Visitor<'de> for EncodedVisitor {
            type Value = EncodedCommand;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an encoded command string or byte sequence")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(EncodedCommand(v.as_bytes().to_vec()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(EncodedCommand(v.into_bytes()))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(EncodedCommand(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(EncodedCommand(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(EncodedCommand(bytes))
            }
        }

        deserializer.deserialize_any(EncodedVisitor)
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedCommand({} bytes)", self.0.len())
    }
}

/// Membership node data: the server's stable id and mesh address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Persisted server id.
    pub server_id: String,
    /// Mesh address other members dial.
    pub addr: String,
}

impl ClusterMember {
    /// Create a member.
    pub fn new(server_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            addr: addr.into(),
        }
    }

    /// Numeric Raft id of this member.
    pub fn node_id(&self) -> ClusterNodeId {
        raft_node_id(&self.server_id)
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.addr)
    }
}

openraft::declare_raft_types!(
    /// OpenRaft type configuration for the fabric controller.
    pub TypeConfig:
        D = EncodedCommand,
        R = ClusterResponse,
        Node = ClusterMember,
);

/// Type alias for Raft instance.
pub type ClusterRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type ClusterEntry = openraft::Entry<TypeConfig>;

/// Type alias for vote.
pub type ClusterVote = openraft::Vote<ClusterNodeId>;

/// Type alias for log ID.
pub type ClusterLogId = openraft::LogId<ClusterNodeId>;

/// Type alias for membership.
pub type ClusterMembership = openraft::Membership<ClusterNodeId, ClusterMember>;

/// Type alias for stored membership.
pub type ClusterStoredMembership = openraft::StoredMembership<ClusterNodeId, ClusterMember>;

/// Type alias for snapshot metadata.
pub type ClusterSnapshotMeta = openraft::SnapshotMeta<ClusterNodeId, ClusterMember>;

/// Type alias for snapshot.
pub type ClusterSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for storage error.
pub type ClusterStorageError = openraft::StorageError<ClusterNodeId>;

/// Type alias for Raft metrics.
pub type ClusterMetrics = openraft::RaftMetrics<ClusterNodeId, ClusterMember>;

/// Map a string server id onto the numeric id OpenRaft requires.
///
/// Uses the first 8 bytes of the SHA-256 digest, big-endian.
pub fn raft_node_id(server_id: &str) -> ClusterNodeId {
    let digest = Sha256::digest(server_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_node_id_is_stable_and_distinct() {
        assert_eq!(raft_node_id("ctrl-a"), raft_node_id("ctrl-a"));
        assert_ne!(raft_node_id("ctrl-a"), raft_node_id("ctrl-b"));
        assert_eq!(
            ClusterMember::new("ctrl-a", "127.0.0.1:1").node_id(),
            raft_node_id("ctrl-a")
        );
    }

    #[test]
    fn test_encoded_command_serializes_as_text() {
        let command = EncodedCommand(br#"{"type":"create"}"#.to_vec());
        let json = serde_json::to_string(&command).expect("serialize");
        assert_eq!(json, r#""{\"type\":\"create\"}""#);
        let back: EncodedCommand = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, command);
    }

    #[test]
    fn test_encoded_command_keeps_binary_bytes() {
        let command = EncodedCommand(vec![0xff, 0x00, 0x7f]);
        let json = serde_json::to_string(&command).expect("serialize");
        assert_eq!(json, "[255,0,127]");
        let back: EncodedCommand = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, command);
    }

    #[test]
    fn test_member_display() {
        let member = ClusterMember::new("ctrl-a", "10.0.0.1:6262");
        assert_eq!(member.to_string(), "ctrl-a@10.0.0.1:6262");
    }
}
