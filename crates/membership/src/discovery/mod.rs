//! Discovery of peers and of the current coordinator
//!
//! Discovery runs independently of the agreed membership: it is how a node
//! finds a group before it belongs to one.

mod cluster;
mod core_nodes;
mod entry_points;
mod worker;

use std::collections::BTreeSet;
use std::fmt;

use crate::node::Node;

pub use cluster::ClusterNodeDiscovery;
pub use core_nodes::CoreDiscovery;
pub use entry_points::EntryPointConnector;
pub use worker::WorkerDiscovery;

/// Discovery progress of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryState {
    /// No peer known
    Undiscovered,
    /// Peers known, coordinator unknown
    Discovered,
    /// A coordinator answered
    CoordinatorKnown,
    /// The local node is a member
    Joined,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undiscovered => f.write_str("undiscovered"),
            Self::Discovered => f.write_str("discovered"),
            Self::CoordinatorKnown => f.write_str("coordinator known"),
            Self::Joined => f.write_str("joined"),
        }
    }
}

/// Source of candidate members for the group membership tracker
pub trait NodeDiscovery {
    /// Whether the local node may originate a brand-new group
    fn can_form_group(&self, now_ms: u64) -> bool;

    /// Hand off and clear the accumulated discovered nodes
    fn take_discovered_nodes(&mut self) -> BTreeSet<Node>;
}
