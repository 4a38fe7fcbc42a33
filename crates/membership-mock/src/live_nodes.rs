use std::collections::BTreeSet;

use parking_lot::Mutex;
use proven_membership::{Address, LiveNodeProvider};

/// Live node provider where every peer is reachable unless marked down.
///
/// A peer name is its address.
#[derive(Default)]
pub struct MockLiveNodeProvider {
    down: Mutex<BTreeSet<String>>,
    connects: Mutex<Vec<String>>,
}

impl MockLiveNodeProvider {
    /// Create a provider with every peer reachable
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer unreachable
    pub fn set_down(&self, name: &str) {
        self.down.lock().insert(name.to_string());
    }

    /// Mark a peer reachable again
    pub fn set_up(&self, name: &str) {
        self.down.lock().remove(name);
    }

    /// Names passed to `connect`, in call order
    pub fn connect_attempts(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

impl LiveNodeProvider for MockLiveNodeProvider {
    fn is_live(&self, address: &Address) -> bool {
        !self.down.lock().contains(address.as_str())
    }

    fn find_by_connection(&self, name: &str) -> Option<Address> {
        (!self.down.lock().contains(name)).then(|| Address::new(name))
    }

    fn connect(&self, name: &str) {
        self.connects.lock().push(name.to_string());
    }

    fn canonicalize(&self, name: &str) -> String {
        name.trim().to_lowercase()
    }
}
