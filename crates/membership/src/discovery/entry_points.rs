//! Lazy resolution of configured entry points

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::collaborators::LiveNodeProvider;
use crate::node::Address;

/// Resolves entry point names to live addresses.
///
/// Connections are never awaited: a missing connection triggers a connect
/// and the name is polled again on later ticks. A new attempt is made only
/// once the connection timeout has elapsed.
pub struct EntryPointConnector {
    entry_points: Vec<String>,
    live_nodes: Arc<dyn LiveNodeProvider>,
    connection_timeout_ms: u64,
    attempts: HashMap<String, u64>,
}

impl EntryPointConnector {
    /// Create a connector for the given entry point names
    pub fn new(
        entry_points: &[String],
        live_nodes: Arc<dyn LiveNodeProvider>,
        connection_timeout_ms: u64,
    ) -> Self {
        let mut seen = HashSet::new();
        let canonical: Vec<String> = entry_points
            .iter()
            .map(|name| live_nodes.canonicalize(name))
            .filter(|name| seen.insert(name.clone()))
            .collect();

        Self {
            entry_points: canonical,
            live_nodes,
            connection_timeout_ms,
            attempts: HashMap::new(),
        }
    }

    /// Canonical entry point names
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    /// Whether any entry point is configured
    pub fn is_empty(&self) -> bool {
        self.entry_points.is_empty()
    }

    /// Resolve one entry point, starting a connection attempt if needed
    pub fn try_resolve(&mut self, name: &str, now_ms: u64) -> Option<Address> {
        if let Some(address) = self.live_nodes.find_by_connection(name) {
            if self.live_nodes.is_live(&address) {
                self.attempts.remove(name);
                return Some(address);
            }
        }

        let due = match self.attempts.get(name) {
            Some(last) => now_ms.saturating_sub(*last) >= self.connection_timeout_ms,
            None => true,
        };
        if due {
            debug!("Connecting to entry point {}", name);
            self.live_nodes.connect(name);
            self.attempts.insert(name.to_string(), now_ms);
        }

        None
    }

    /// Resolve every entry point that is live now
    pub fn resolve_all(&mut self, now_ms: u64) -> Vec<Address> {
        let names = self.entry_points.clone();
        names
            .iter()
            .filter_map(|name| self.try_resolve(name, now_ms))
            .collect()
    }

    /// Whether an attempt on `name` started at least a timeout ago without success
    pub fn has_timed_out(&self, name: &str, now_ms: u64) -> bool {
        self.attempts
            .get(name)
            .is_some_and(|last| now_ms.saturating_sub(*last) >= self.connection_timeout_ms)
    }
}
