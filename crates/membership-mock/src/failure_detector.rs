use std::collections::BTreeSet;

use parking_lot::Mutex;
use proven_membership::{FailureDetector, Node};

#[derive(Default)]
struct Suspicions {
    failed: BTreeSet<Node>,
    left: BTreeSet<Node>,
    healthy: BTreeSet<Node>,
    coordinator: Option<Node>,
}

/// Failure detector whose verdicts are set by the test
#[derive(Default)]
pub struct MockFailureDetector {
    state: Mutex<Suspicions>,
}

impl MockFailureDetector {
    /// Create a detector reporting nothing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `node` as crashed
    pub fn fail(&self, node: &Node) {
        let mut state = self.state.lock();
        state.healthy.remove(node);
        state.left.remove(node);
        state.failed.insert(node.clone());
    }

    /// Report `node` as departed gracefully
    pub fn leave(&self, node: &Node) {
        let mut state = self.state.lock();
        state.healthy.remove(node);
        state.failed.remove(node);
        state.left.insert(node.clone());
    }

    /// Report `node` as healthy again
    pub fn recover(&self, node: &Node) {
        let mut state = self.state.lock();
        state.failed.remove(node);
        state.left.remove(node);
        state.healthy.insert(node.clone());
    }

    /// Forget every verdict about `node`
    pub fn forget(&self, node: &Node) {
        let mut state = self.state.lock();
        state.failed.remove(node);
        state.left.remove(node);
        state.healthy.remove(node);
    }

    /// Override the reported coordinator
    pub fn set_coordinator(&self, coordinator: Option<Node>) {
        self.state.lock().coordinator = coordinator;
    }
}

impl FailureDetector for MockFailureDetector {
    fn failed_members(&self) -> BTreeSet<Node> {
        self.state.lock().failed.clone()
    }

    fn left_members(&self) -> BTreeSet<Node> {
        self.state.lock().left.clone()
    }

    fn healthy_members(&self) -> BTreeSet<Node> {
        self.state.lock().healthy.clone()
    }

    fn current_coordinator(&self) -> Option<Node> {
        self.state.lock().coordinator.clone()
    }
}
