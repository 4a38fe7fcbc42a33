//! Versioned views of a single group

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{Group, GroupChange, GroupDelta};
use crate::error::{MembershipResult, ensure_invariant};
use crate::node::Node;

/// Versioned agreed view of one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    id: u64,
    group: Group,
}

impl GroupMembership {
    /// Create a membership version
    pub fn new(id: u64, group: Group) -> MembershipResult<Self> {
        ensure_invariant!(id > 0, "group membership id must be positive");
        Ok(Self { id, group })
    }

    /// Membership id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Group of this membership
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Build the next membership version from a delta
    pub fn apply(&self, delta: &GroupMembershipDelta) -> MembershipResult<GroupMembership> {
        ensure_invariant!(
            delta.id == self.id + 1,
            "group membership delta {} does not follow {}",
            delta.id,
            self.id
        );

        GroupMembership::new(delta.id, self.group.apply(&delta.group)?)
    }
}

impl fmt::Display for GroupMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "membership {} of {}", self.id, self.group)
    }
}

/// Change between two consecutive group memberships
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembershipDelta {
    /// Membership id after the change
    pub id: u64,
    /// Group change
    pub group: GroupDelta,
}

/// Externally observable membership change delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembershipChange {
    /// Membership after the change
    pub membership: GroupMembership,
    /// Nodes that joined
    pub joined: Vec<Node>,
    /// Members that left gracefully
    pub left: Vec<Node>,
    /// Members that failed
    pub failed: Vec<Node>,
}

impl GroupMembershipChange {
    /// Describe the change from `old` to `new` carried by `delta`
    pub fn new(old: &GroupMembership, new: GroupMembership, delta: &GroupMembershipDelta) -> Self {
        let change = GroupChange::new(old.group(), new.group().clone(), &delta.group);
        Self {
            membership: new,
            joined: change.joined,
            left: change.left,
            failed: change.failed,
        }
    }

    /// Describe the change between two memberships by comparing member lists
    pub fn between(old: &GroupMembership, new: GroupMembership) -> Self {
        let joined = new
            .group()
            .members()
            .iter()
            .filter(|member| !old.group().contains(&member.id()))
            .cloned()
            .collect();
        let left = old
            .group()
            .members()
            .iter()
            .filter(|member| !new.group().contains(&member.id()))
            .cloned()
            .collect();

        Self {
            membership: new,
            joined,
            left,
            failed: Vec::new(),
        }
    }
}
