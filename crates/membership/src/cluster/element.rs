//! Elements of a domain membership, one per registered provider

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::GroupDefinition;
use crate::group::{Group, GroupChange, GroupDelta};
use crate::node::{Node, NodeId};

/// Nodes of one domain, in admission order
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMembership {
    /// Member nodes
    pub nodes: Vec<Node>,
}

impl NodeMembership {
    /// Whether the node belongs to the domain
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.iter().any(|node| node.id() == *node_id)
    }

    /// Find a node by id
    pub fn find(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id() == *node_id)
    }
}

/// Managed groups of one domain together with their definitions
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsMembership {
    /// Groups by id
    pub groups: BTreeMap<Uuid, Group>,
    /// Definitions by group id
    pub definitions: BTreeMap<Uuid, GroupDefinition>,
}

impl GroupsMembership {
    /// Groups containing the node
    pub fn groups_of<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a Group> + 'a {
        self.groups.values().filter(move |group| group.contains(node_id))
    }
}

/// Binding of every worker node of a domain to the core node serving it
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerToCoreMembership {
    /// Worker id to core node id
    pub bindings: BTreeMap<NodeId, NodeId>,
}

impl WorkerToCoreMembership {
    /// Number of workers bound to each core node
    pub fn load(&self) -> BTreeMap<NodeId, usize> {
        let mut load = BTreeMap::new();
        for core in self.bindings.values() {
            *load.entry(*core).or_insert(0) += 1;
        }
        load
    }
}

/// Slice of a domain membership owned by one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMembershipElement {
    /// Node membership
    Node(NodeMembership),
    /// Groups membership
    Groups(GroupsMembership),
    /// Worker to core bindings
    WorkerToCore(WorkerToCoreMembership),
}

impl ClusterMembershipElement {
    /// Node membership, if this element is one
    pub fn as_node(&self) -> Option<&NodeMembership> {
        match self {
            Self::Node(element) => Some(element),
            _ => None,
        }
    }

    /// Groups membership, if this element is one
    pub fn as_groups(&self) -> Option<&GroupsMembership> {
        match self {
            Self::Groups(element) => Some(element),
            _ => None,
        }
    }

    /// Worker to core bindings, if this element is one
    pub fn as_worker_to_core(&self) -> Option<&WorkerToCoreMembership> {
        match self {
            Self::WorkerToCore(element) => Some(element),
            _ => None,
        }
    }
}

/// Change of a node membership
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMembershipDelta {
    /// Computed against an absent prior element
    pub full: bool,
    /// Admitted nodes (every node when full)
    pub joined: Vec<Node>,
    /// Nodes that left gracefully
    pub left: BTreeSet<NodeId>,
    /// Nodes that failed
    pub failed: BTreeSet<NodeId>,
}

impl NodeMembershipDelta {
    /// Whether the delta changes anything
    pub fn is_empty(&self) -> bool {
        !self.full && self.joined.is_empty() && self.left.is_empty() && self.failed.is_empty()
    }

    /// Ids of nodes removed by the delta
    pub fn removed(&self) -> BTreeSet<NodeId> {
        self.left.union(&self.failed).copied().collect()
    }
}

/// Change of a groups membership
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsMembershipDelta {
    /// Computed against an absent prior element
    pub full: bool,
    /// New or changed groups; new groups carry full group deltas
    pub groups: Vec<GroupDelta>,
    /// Dropped groups
    pub removed_groups: BTreeSet<Uuid>,
    /// Added or replaced definitions
    pub added_definitions: Vec<GroupDefinition>,
    /// Removed definitions
    pub removed_definitions: BTreeSet<Uuid>,
}

impl GroupsMembershipDelta {
    /// Whether the delta changes anything
    pub fn is_empty(&self) -> bool {
        !self.full
            && self.groups.is_empty()
            && self.removed_groups.is_empty()
            && self.added_definitions.is_empty()
            && self.removed_definitions.is_empty()
    }
}

/// Change of worker to core bindings
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerToCoreMembershipDelta {
    /// Computed against an absent prior element
    pub full: bool,
    /// New or moved bindings
    pub bound: BTreeMap<NodeId, NodeId>,
    /// Workers no longer bound
    pub unbound: BTreeSet<NodeId>,
}

impl WorkerToCoreMembershipDelta {
    /// Whether the delta changes anything
    pub fn is_empty(&self) -> bool {
        !self.full && self.bound.is_empty() && self.unbound.is_empty()
    }
}

/// Delta of one element; `Empty` keeps positional alignment for providers
/// with nothing to say
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMembershipElementDelta {
    /// No change
    Empty,
    /// Node membership delta
    Node(NodeMembershipDelta),
    /// Groups membership delta
    Groups(GroupsMembershipDelta),
    /// Worker to core delta
    WorkerToCore(WorkerToCoreMembershipDelta),
}

impl ClusterMembershipElementDelta {
    /// Whether this is the empty placeholder
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Node membership delta, if this is one
    pub fn as_node(&self) -> Option<&NodeMembershipDelta> {
        match self {
            Self::Node(delta) => Some(delta),
            _ => None,
        }
    }
}

/// Observable change of a node membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMembershipChange {
    /// Admitted nodes
    pub joined: Vec<Node>,
    /// Nodes that left gracefully
    pub left: Vec<Node>,
    /// Nodes that failed
    pub failed: Vec<Node>,
}

/// Observable change of a groups membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupsMembershipChange {
    /// Groups created this round
    pub new_groups: Vec<Group>,
    /// Groups whose membership changed
    pub changed_groups: Vec<GroupChange>,
    /// Groups dropped this round
    pub removed_groups: Vec<Group>,
}

/// Observable change of worker to core bindings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerToCoreMembershipChange {
    /// New or moved bindings
    pub bound: BTreeMap<NodeId, NodeId>,
    /// Workers no longer bound
    pub unbound: BTreeSet<NodeId>,
}

/// Observable change of one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMembershipElementChange {
    /// Node membership change
    Node(NodeMembershipChange),
    /// Groups membership change
    Groups(GroupsMembershipChange),
    /// Worker to core change
    WorkerToCore(WorkerToCoreMembershipChange),
}
