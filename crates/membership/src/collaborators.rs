//! Interfaces of the collaborators the membership core depends on
//!
//! Implementations live outside this crate: the transport, the failure
//! detector, the flush coordinator and the state transfer store. In-memory
//! versions for tests are provided by `proven-membership-mock`.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::cluster::ClusterMembershipDelta;
use crate::error::MembershipResult;
use crate::group::{GroupMembership, GroupMembershipDelta};
use crate::message::Message;
use crate::node::{Address, Node};

/// Outbound side of the shared channel.
///
/// Sending never blocks; delivery is the transport's concern.
pub trait MessageSender: Send + Sync + 'static {
    /// Queue a message for delivery to its destination
    fn send(&self, message: Message) -> MembershipResult<()>;
}

/// Source of failure information about the members of one group
pub trait FailureDetector: Send + Sync + 'static {
    /// Members suspected to have crashed
    fn failed_members(&self) -> BTreeSet<Node>;

    /// Members that departed gracefully
    fn left_members(&self) -> BTreeSet<Node>;

    /// Members considered healthy
    fn healthy_members(&self) -> BTreeSet<Node>;

    /// Current coordinator of the group, if one is known
    fn current_coordinator(&self) -> Option<Node>;
}

/// View-synchronous cutover of group memberships
pub trait FlushCoordinator: Send + Sync + 'static {
    /// Start installing `membership` on all its members.
    ///
    /// `delta` is absent for the very first membership of a group.
    fn install(
        &self,
        membership: GroupMembership,
        delta: Option<GroupMembershipDelta>,
    ) -> MembershipResult<()>;

    /// Whether a flush is currently running
    fn is_flush_in_progress(&self) -> bool;
}

/// Veto hook consulted before a flush is requested
pub trait FlushCondition: Send + Sync + 'static {
    /// Whether installing `delta` on top of `current` may start now
    fn can_start_flush(&self, current: &GroupMembership, delta: &GroupMembershipDelta) -> bool;
}

/// Connection and liveness information for named peers
pub trait LiveNodeProvider: Send + Sync + 'static {
    /// Whether a connection to the address is established and alive
    fn is_live(&self, address: &Address) -> bool;

    /// Address of an established connection to the named peer
    fn find_by_connection(&self, name: &str) -> Option<Address>;

    /// Start connecting to the named peer without waiting for completion
    fn connect(&self, name: &str);

    /// Canonical form of a peer name
    fn canonicalize(&self, name: &str) -> String;
}

/// Durable full snapshots of the composite cluster membership
pub trait StateTransferStore: Send + Sync + 'static {
    /// Save a full snapshot under `key`
    fn save(&self, key: Uuid, snapshot: ClusterMembershipDelta) -> MembershipResult<()>;

    /// Load the snapshot saved under `key`
    fn load(&self, key: Uuid) -> MembershipResult<Option<ClusterMembershipDelta>>;
}

/// Decides which discovered peers are no longer worth tracking
pub trait DiscoveryCleanupPolicy: Send + Sync + 'static {
    /// Whether the node should be purged from discovery state
    fn is_unreachable(&self, node: &Node) -> bool;

    /// Whether a known coordinator address should be forgotten
    fn is_coordinator_unreachable(&self, address: &Address) -> bool;
}
