use std::collections::BTreeSet;

use parking_lot::Mutex;
use proven_membership::{Address, DiscoveryCleanupPolicy, Node, NodeId};

/// Cleanup policy purging exactly the peers marked unreachable
#[derive(Default)]
pub struct MockCleanupPolicy {
    nodes: Mutex<BTreeSet<NodeId>>,
    addresses: Mutex<BTreeSet<Address>>,
}

impl MockCleanupPolicy {
    /// Create a policy keeping every peer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a node, and its address as a coordinator, unreachable
    pub fn mark_unreachable(&self, node: &Node) {
        self.nodes.lock().insert(node.id());
        self.addresses.lock().insert(node.address().clone());
    }

    /// Declare a node reachable again
    pub fn mark_reachable(&self, node: &Node) {
        self.nodes.lock().remove(&node.id());
        self.addresses.lock().remove(node.address());
    }
}

impl DiscoveryCleanupPolicy for MockCleanupPolicy {
    fn is_unreachable(&self, node: &Node) -> bool {
        self.nodes.lock().contains(&node.id())
    }

    fn is_coordinator_unreachable(&self, address: &Address) -> bool {
        self.addresses.lock().contains(address)
    }
}
