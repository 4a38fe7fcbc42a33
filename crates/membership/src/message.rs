//! Message parts exchanged by the membership protocols
//!
//! A [`Message`] carries a stack of typed parts. Protocols push their part on
//! send and inspect/pop the outermost part on receive.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::ClusterMembershipDelta;
use crate::error::{MembershipResult, ensure_invariant};
use crate::group::GroupAddress;
use crate::node::{Address, Node};

/// Destination of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A single node
    Node(Address),
    /// Every member of a group
    Group(GroupAddress),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(address) => write!(f, "node {address}"),
            Self::Group(group) => write!(f, "group {group}"),
        }
    }
}

/// Peer and coordinator discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessagePart {
    /// Nodes known to the sender, the sender included
    pub discovered_nodes: BTreeSet<Node>,
    /// Sent by core discovery
    pub core: bool,
}

/// Worker request for admission to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupJoinMessagePart {
    /// Node requesting admission
    pub joining_node: Node,
}

/// Coordinator answer to a discovering node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipResponseMessagePart {
    /// Installed group membership id
    pub membership_id: u64,
    /// Healthy members, coordinator first
    pub healthy_members: Vec<Address>,
}

impl MembershipResponseMessagePart {
    /// Create a response; the member list must not be empty
    pub fn new(membership_id: u64, healthy_members: Vec<Address>) -> MembershipResult<Self> {
        ensure_invariant!(
            !healthy_members.is_empty(),
            "membership response must name at least one healthy member"
        );
        Ok(Self {
            membership_id,
            healthy_members,
        })
    }

    /// Coordinator named by the response
    pub fn coordinator(&self) -> Option<&Address> {
        self.healthy_members.first()
    }
}

/// Composite delta broadcast of one dissemination round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembershipMessagePart {
    /// Round the delta belongs to
    pub round_id: u64,
    /// Delta to apply
    pub delta: ClusterMembershipDelta,
}

/// Acknowledgement of a dissemination round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembershipResponseMessagePart {
    /// Acknowledged round
    pub round_id: u64,
}

/// Per-group routing envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessagePart {
    /// Target group
    pub group_id: Uuid,
}

/// Kind of a message part, carrying its stable wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    /// [`DiscoveryMessagePart`]
    Discovery,
    /// [`GroupJoinMessagePart`]
    GroupJoin,
    /// [`MembershipResponseMessagePart`]
    MembershipResponse,
    /// [`ClusterMembershipMessagePart`]
    ClusterMembership,
    /// [`ClusterMembershipResponseMessagePart`]
    ClusterMembershipResponse,
    /// [`GroupMessagePart`]
    Group,
}

impl PartKind {
    /// Every part kind
    pub const ALL: [PartKind; 6] = [
        Self::Discovery,
        Self::GroupJoin,
        Self::MembershipResponse,
        Self::ClusterMembership,
        Self::ClusterMembershipResponse,
        Self::Group,
    ];

    /// Stable wire type tag
    pub const fn type_id(self) -> Uuid {
        match self {
            Self::Discovery => Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0001),
            Self::GroupJoin => Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0002),
            Self::MembershipResponse => Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0003),
            Self::ClusterMembership => Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0004),
            Self::ClusterMembershipResponse => {
                Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0005)
            }
            Self::Group => Uuid::from_u128(0x0d15_c0fe_0000_4000_8000_0000_0000_0006),
        }
    }

    /// Wire format version
    pub const fn version(self) -> u8 {
        1
    }
}

/// Typed message part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePart {
    /// Discovery
    Discovery(DiscoveryMessagePart),
    /// Worker admission request
    GroupJoin(GroupJoinMessagePart),
    /// Discovery response from the coordinator
    MembershipResponse(MembershipResponseMessagePart),
    /// Cluster membership delta
    ClusterMembership(ClusterMembershipMessagePart),
    /// Cluster membership acknowledgement
    ClusterMembershipResponse(ClusterMembershipResponseMessagePart),
    /// Group routing envelope
    Group(GroupMessagePart),
}

impl MessagePart {
    /// Kind of this part
    pub fn kind(&self) -> PartKind {
        match self {
            Self::Discovery(_) => PartKind::Discovery,
            Self::GroupJoin(_) => PartKind::GroupJoin,
            Self::MembershipResponse(_) => PartKind::MembershipResponse,
            Self::ClusterMembership(_) => PartKind::ClusterMembership,
            Self::ClusterMembershipResponse(_) => PartKind::ClusterMembershipResponse,
            Self::Group(_) => PartKind::Group,
        }
    }
}

/// Message travelling between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender address
    pub source: Address,
    /// Destination
    pub destination: Destination,
    /// Part stack; the last element is the outermost part
    parts: Vec<MessagePart>,
    /// Opaque application payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message with a single part
    pub fn new(source: Address, destination: Destination, part: MessagePart) -> Self {
        Self {
            source,
            destination,
            parts: vec![part],
            payload: Bytes::new(),
        }
    }

    /// Create a message carrying only a payload
    pub fn with_payload(source: Address, destination: Destination, payload: Bytes) -> Self {
        Self {
            source,
            destination,
            parts: Vec::new(),
            payload,
        }
    }

    /// Create a message from raw parts (innermost first)
    pub fn from_parts(
        source: Address,
        destination: Destination,
        parts: Vec<MessagePart>,
        payload: Bytes,
    ) -> Self {
        Self {
            source,
            destination,
            parts,
            payload,
        }
    }

    /// Push an outer envelope part
    pub fn push_part(&mut self, part: MessagePart) {
        self.parts.push(part);
    }

    /// Outermost part
    pub fn top_part(&self) -> Option<&MessagePart> {
        self.parts.last()
    }

    /// Remove and return the outermost part
    pub fn pop_part(&mut self) -> Option<MessagePart> {
        self.parts.pop()
    }

    /// All parts, innermost first
    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    /// Copy of this message readdressed to another destination
    pub fn readdressed(&self, destination: Destination) -> Self {
        Self {
            destination,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_stack_order() {
        let mut message = Message::new(
            Address::new("a:1"),
            Destination::Node(Address::new("b:1")),
            MessagePart::ClusterMembershipResponse(ClusterMembershipResponseMessagePart {
                round_id: 3,
            }),
        );
        let group_id = Uuid::new_v4();
        message.push_part(MessagePart::Group(GroupMessagePart { group_id }));

        assert_eq!(message.top_part().map(MessagePart::kind), Some(PartKind::Group));
        assert_eq!(
            message.pop_part(),
            Some(MessagePart::Group(GroupMessagePart { group_id }))
        );
        assert_eq!(
            message.top_part().map(MessagePart::kind),
            Some(PartKind::ClusterMembershipResponse)
        );
    }

    #[test]
    fn test_type_tags_are_unique() {
        let tags: BTreeSet<Uuid> = PartKind::ALL.iter().map(|k| k.type_id()).collect();
        assert_eq!(tags.len(), PartKind::ALL.len());
    }

    #[test]
    fn test_membership_response_requires_members() {
        assert!(MembershipResponseMessagePart::new(1, vec![]).is_err());

        let response =
            MembershipResponseMessagePart::new(4, vec![Address::new("c:1"), Address::new("d:1")])
                .unwrap();
        assert_eq!(response.coordinator(), Some(&Address::new("c:1")));
    }
}
