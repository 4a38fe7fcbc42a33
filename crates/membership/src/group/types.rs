//! Group value types and group deltas

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MembershipError, MembershipResult, ensure_invariant};
use crate::node::{Node, NodeId};

/// Reserved id of the core control group
pub const CORE_GROUP_ID: Uuid = Uuid::from_u128(0x5e0c_0000_0000_4000_8000_0000_0000_0001);

/// Reserved name of the core control group
pub const CORE_GROUP_NAME: &str = "core";

/// Options attached to a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupOption {
    /// The group is the core control group
    Core,
    /// Group state survives restarts of all members
    Durable,
    /// New members receive state through a blocking snapshot transfer
    SimpleStateTransfer,
    /// New members receive state asynchronously after joining
    AsyncStateTransfer,
}

/// Address identity of a group, usable as a message destination
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupAddress {
    /// Group id
    pub id: Uuid,
    /// Group name
    pub name: String,
}

impl GroupAddress {
    /// Create a new group address
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Address of the core control group
    pub fn core() -> Self {
        Self::new(CORE_GROUP_ID, CORE_GROUP_NAME)
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id.simple())
    }
}

/// Agreed structure of one group.
///
/// The coordinator is always the first member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    id: Uuid,
    change_id: u64,
    name: String,
    primary: bool,
    members: Vec<Node>,
    options: BTreeSet<GroupOption>,
}

impl Group {
    /// Create a group, validating its structural invariants
    pub fn new(
        id: Uuid,
        change_id: u64,
        name: impl Into<String>,
        primary: bool,
        members: Vec<Node>,
        options: BTreeSet<GroupOption>,
    ) -> MembershipResult<Self> {
        let name = name.into();
        ensure_invariant!(change_id > 0, "group {name} must have a positive change id");
        ensure_invariant!(!members.is_empty(), "group {name} must have members");

        let unique: BTreeSet<NodeId> = members.iter().map(Node::id).collect();
        ensure_invariant!(
            unique.len() == members.len(),
            "group {name} has duplicate members"
        );

        Ok(Self {
            id,
            change_id,
            name,
            primary,
            members,
            options,
        })
    }

    /// Group id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Structural change counter
    pub fn change_id(&self) -> u64 {
        self.change_id
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the group is in the primary partition
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Ordered member list
    pub fn members(&self) -> &[Node] {
        &self.members
    }

    /// Group options
    pub fn options(&self) -> &BTreeSet<GroupOption> {
        &self.options
    }

    /// Group coordinator (first member)
    pub fn coordinator(&self) -> &Node {
        &self.members[0]
    }

    /// Address of the group
    pub fn address(&self) -> GroupAddress {
        GroupAddress::new(self.id, self.name.clone())
    }

    /// Whether the node is a member of the group
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.members.iter().any(|member| member.id() == *node_id)
    }

    /// Find a member by id
    pub fn find_member(&self, node_id: &NodeId) -> Option<&Node> {
        self.members.iter().find(|member| member.id() == *node_id)
    }

    /// Position of a member in the agreed order
    pub fn member_index(&self, node_id: &NodeId) -> Option<usize> {
        self.members.iter().position(|member| member.id() == *node_id)
    }

    /// Build the next version of this group from a delta
    pub fn apply(&self, delta: &GroupDelta) -> MembershipResult<Group> {
        ensure_invariant!(
            delta.group_id == self.id,
            "delta for group {} applied to group {}",
            delta.group_id,
            self.id
        );

        if delta.full {
            return delta.to_group();
        }

        ensure_invariant!(
            delta.change_id == self.change_id + 1,
            "group {} change id {} does not follow {}",
            self.name,
            delta.change_id,
            self.change_id
        );

        let mut members: Vec<Node> = self
            .members
            .iter()
            .filter(|member| {
                !delta.left.contains(&member.id()) && !delta.failed.contains(&member.id())
            })
            .cloned()
            .collect();

        for node in &delta.joined {
            ensure_invariant!(
                !members.contains(node),
                "node {} joined group {} twice",
                node.id(),
                self.name
            );
            members.push(node.clone());
        }

        Group::new(
            self.id,
            delta.change_id,
            delta.name.clone(),
            delta.primary,
            members,
            delta.options.clone(),
        )
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<_> = self.members.iter().map(|m| m.name().to_string()).collect();
        write!(
            f,
            "{}#{} primary={} [{}]",
            self.name,
            self.change_id,
            self.primary,
            members.join(", ")
        )
    }
}

/// Incremental (or full) change of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDelta {
    /// Id of the changed group
    pub group_id: Uuid,
    /// Group name after the change
    pub name: String,
    /// Change id after the change
    pub change_id: u64,
    /// Primary flag after the change
    pub primary: bool,
    /// Group options after the change
    pub options: BTreeSet<GroupOption>,
    /// Computed against an absent prior group
    pub full: bool,
    /// Nodes that joined, in join order
    pub joined: Vec<Node>,
    /// Members that left gracefully
    pub left: BTreeSet<NodeId>,
    /// Members that failed
    pub failed: BTreeSet<NodeId>,
}

impl GroupDelta {
    /// Create a full delta describing the whole group
    pub fn full(group: &Group) -> Self {
        Self {
            group_id: group.id,
            name: group.name.clone(),
            change_id: group.change_id,
            primary: group.primary,
            options: group.options.clone(),
            full: true,
            joined: group.members.clone(),
            left: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Create an incremental delta following `group`
    pub fn next(group: &Group, primary: bool) -> Self {
        Self {
            group_id: group.id,
            name: group.name.clone(),
            change_id: group.change_id + 1,
            primary,
            options: group.options.clone(),
            full: false,
            joined: Vec::new(),
            left: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Whether the delta changes the member list
    pub fn is_structural(&self) -> bool {
        !self.joined.is_empty() || !self.left.is_empty() || !self.failed.is_empty()
    }

    fn to_group(&self) -> MembershipResult<Group> {
        if !self.full {
            return Err(MembershipError::invariant(format!(
                "incremental delta of group {} cannot build a group on its own",
                self.name
            )));
        }

        Group::new(
            self.group_id,
            self.change_id,
            self.name.clone(),
            self.primary,
            self.joined.clone(),
            self.options.clone(),
        )
    }

    /// Build a group from a full delta
    pub fn create_group(&self) -> MembershipResult<Group> {
        self.to_group()
    }
}

/// Externally observable change of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    /// Group after the change
    pub group: Group,
    /// Nodes that joined
    pub joined: Vec<Node>,
    /// Members that left gracefully
    pub left: Vec<Node>,
    /// Members that failed
    pub failed: Vec<Node>,
}

impl GroupChange {
    /// Resolve the nodes referenced by `delta` against the prior group
    pub fn new(old: &Group, new: Group, delta: &GroupDelta) -> Self {
        let resolve = |ids: &BTreeSet<NodeId>| -> Vec<Node> {
            old.members()
                .iter()
                .filter(|member| ids.contains(&member.id()))
                .cloned()
                .collect()
        };

        Self {
            group: new,
            joined: delta.joined.clone(),
            left: resolve(&delta.left),
            failed: resolve(&delta.failed),
        }
    }
}
