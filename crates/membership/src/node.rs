//! Node identity types

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved domain of the core control group
pub const CORE_DOMAIN: &str = "core";

/// Unique identifier of a node
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a node id from a UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Create a random node id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node id from a numeric value.
    ///
    /// Ordering of ids created this way follows the numeric ordering.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<Uuid> for NodeId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Canonical transport address of a node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create an address from its canonical name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the canonical name of the address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Address {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Immutable record describing a node.
///
/// Equality, ordering and hashing only consider the node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    name: String,
    address: Address,
    domain: String,
    properties: BTreeMap<String, serde_json::Value>,
}

impl Node {
    /// Create a node without properties
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        address: impl Into<Address>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            domain: domain.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Attach a property to the node record
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Get the node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the node address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Get the domain the node belongs to
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether the node belongs to the core domain
    pub fn is_core(&self) -> bool {
        self.domain == CORE_DOMAIN
    }

    /// Get the node properties
    pub fn properties(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.properties
    }

    /// Get a single property
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_is_id_only() {
        let a = Node::new(NodeId::from_u128(1), "a", "a:1", CORE_DOMAIN);
        let renamed = Node::new(NodeId::from_u128(1), "other", "b:2", "workers");

        assert_eq!(a, renamed);
        assert!(a.is_core());
        assert!(!renamed.is_core());
    }

    #[test]
    fn test_node_ordering_follows_numeric_id() {
        let mut nodes = vec![
            Node::new(NodeId::from_u128(3), "c", "c:1", CORE_DOMAIN),
            Node::new(NodeId::from_u128(1), "a", "a:1", CORE_DOMAIN),
            Node::new(NodeId::from_u128(256), "d", "d:1", CORE_DOMAIN),
            Node::new(NodeId::from_u128(2), "b", "b:1", CORE_DOMAIN),
        ];
        nodes.sort();

        let names: Vec<_> = nodes.iter().map(Node::name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_node_properties() {
        let node = Node::new(NodeId::random(), "w", "w:1", "workers")
            .with_property("zone", serde_json::json!("eu-1"));

        assert_eq!(node.property("zone"), Some(&serde_json::json!("eu-1")));
        assert_eq!(node.property("rack"), None);
    }
}
