//! Join and remove requests, and the members gathered before bootstrap.

use crate::error::{ClusterError, ClusterResult};
use crate::types::{ClusterMember, ClusterNodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to add a server to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Server id of the joining node.
    pub id: String,
    /// Mesh address of the joining node.
    pub addr: String,
    /// Whether the node should vote.
    pub is_voter: bool,
}

impl JoinRequest {
    /// A voting join.
    pub fn voter(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            is_voter: true,
        }
    }

    /// A non-voting join.
    pub fn nonvoter(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            is_voter: false,
            ..Self::voter(id, addr)
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.id.is_empty() {
            return Err(ClusterError::Membership("invalid server id".to_string()));
        }
        if self.addr.is_empty() {
            return Err(ClusterError::Membership("invalid server address".to_string()));
        }
        Ok(())
    }

    pub(crate) fn member(&self) -> ClusterMember {
        ClusterMember::new(self.id.clone(), self.addr.clone())
    }
}

/// Request to remove a server from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub id: String,
}

impl RemoveRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.id.is_empty() {
            return Err(ClusterError::Membership("invalid server id".to_string()));
        }
        Ok(())
    }
}

/// Join requests accumulated until enough voters are known to bootstrap.
///
/// Requests are keyed by server id; a repeated join replaces the earlier one.
#[derive(Debug, Default)]
pub(crate) struct PendingMembers {
    members: BTreeMap<String, JoinRequest>,
}

impl PendingMembers {
    pub fn add(&mut self, request: JoinRequest) {
        self.members.insert(request.id.clone(), request);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn voter_count(&self) -> usize {
        self.members.values().filter(|m| m.is_voter).count()
    }

    /// The initial voter set, keyed by Raft id.
    pub fn voters(&self) -> BTreeMap<ClusterNodeId, ClusterMember> {
        self.members
            .values()
            .filter(|m| m.is_voter)
            .map(|m| {
                let member = m.member();
                (member.node_id(), member)
            })
            .collect()
    }

    /// Drain every request, returning the non-voters.
    pub fn take_nonvoters(&mut self) -> Vec<JoinRequest> {
        std::mem::take(&mut self.members)
            .into_values()
            .filter(|m| !m.is_voter)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_validation() {
        assert!(JoinRequest::voter("a", "h:1").validate().is_ok());
        assert!(matches!(
            JoinRequest::voter("", "h:1").validate(),
            Err(ClusterError::Membership(_))
        ));
        assert!(matches!(
            JoinRequest::voter("a", "").validate(),
            Err(ClusterError::Membership(_))
        ));
        assert!(RemoveRequest::new("").validate().is_err());
    }

    #[test]
    fn test_join_request_wire_format() {
        let json = serde_json::to_value(JoinRequest::nonvoter("a", "h:1")).expect("json");
        assert_eq!(
            json,
            serde_json::json!({"id": "a", "addr": "h:1", "isVoter": false})
        );
    }

    #[test]
    fn test_pending_counts_distinct_voters() {
        let mut pending = PendingMembers::default();
        pending.add(JoinRequest::voter("a", "h:1"));
        pending.add(JoinRequest::voter("a", "h:1"));
        pending.add(JoinRequest::nonvoter("b", "h:2"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.voter_count(), 1);

        pending.add(JoinRequest::voter("c", "h:3"));
        let voters = pending.voters();
        assert_eq!(voters.len(), 2);
        assert!(voters.values().all(|m| m.server_id != "b"));
        assert_eq!(
            voters.get(&crate::types::raft_node_id("c")).map(|m| m.addr.as_str()),
            Some("h:3")
        );
    }

    #[test]
    fn test_repeat_join_replaces_suffrage() {
        let mut pending = PendingMembers::default();
        pending.add(JoinRequest::nonvoter("a", "h:1"));
        pending.add(JoinRequest::voter("a", "h:1"));
        assert_eq!(pending.voter_count(), 1);
    }

    #[test]
    fn test_take_nonvoters_drains() {
        let mut pending = PendingMembers::default();
        pending.add(JoinRequest::voter("a", "h:1"));
        pending.add(JoinRequest::nonvoter("b", "h:2"));
        let nonvoters = pending.take_nonvoters();
        assert_eq!(nonvoters, vec![JoinRequest::nonvoter("b", "h:2")]);
        assert_eq!(pending.len(), 0);
    }
}
