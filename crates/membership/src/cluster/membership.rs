//! Composite, versioned cluster membership

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    GroupsMembership, NodeMembership, WorkerToCoreMembership,
};
use crate::error::{MembershipResult, ensure_invariant};
use crate::node::{CORE_DOMAIN, Node};

/// Membership of one domain: one element per registered provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMembership {
    name: String,
    elements: Vec<Arc<ClusterMembershipElement>>,
}

impl DomainMembership {
    /// Create a domain membership
    pub fn new(name: impl Into<String>, elements: Vec<Arc<ClusterMembershipElement>>) -> Self {
        Self {
            name: name.into(),
            elements,
        }
    }

    /// Domain name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the reserved core domain
    pub fn is_core(&self) -> bool {
        self.name == CORE_DOMAIN
    }

    /// Elements in provider registration order
    pub fn elements(&self) -> &[Arc<ClusterMembershipElement>] {
        &self.elements
    }

    /// Element of the provider at `index`
    pub fn element(&self, index: usize) -> Option<&Arc<ClusterMembershipElement>> {
        self.elements.get(index)
    }

    /// Node membership of the domain
    pub fn nodes(&self) -> Option<&NodeMembership> {
        self.elements.iter().find_map(|element| element.as_node())
    }

    /// Groups membership of the domain
    pub fn groups(&self) -> Option<&GroupsMembership> {
        self.elements.iter().find_map(|element| element.as_groups())
    }

    /// Worker to core bindings of the domain
    pub fn worker_to_core(&self) -> Option<&WorkerToCoreMembership> {
        self.elements
            .iter()
            .find_map(|element| element.as_worker_to_core())
    }
}

/// Agreed composite view of the whole cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembership {
    id: u64,
    domains: Vec<Arc<DomainMembership>>,
}

impl ClusterMembership {
    /// Create a cluster membership.
    ///
    /// Domain names are unique, the core domain comes first and every domain
    /// carries `provider_count` elements.
    pub fn new(
        id: u64,
        domains: Vec<Arc<DomainMembership>>,
        provider_count: usize,
    ) -> MembershipResult<Self> {
        ensure_invariant!(id > 0, "cluster membership id must be positive");

        let names: BTreeSet<&str> = domains.iter().map(|d| d.name()).collect();
        ensure_invariant!(
            names.len() == domains.len(),
            "cluster membership {id} has duplicate domains"
        );
        ensure_invariant!(
            domains.iter().skip(1).all(|d| !d.is_core()),
            "core domain of cluster membership {id} must come first"
        );
        for domain in &domains {
            ensure_invariant!(
                domain.elements().len() == provider_count,
                "domain {} has {} elements but {} providers are registered",
                domain.name(),
                domain.elements().len(),
                provider_count
            );
        }

        Ok(Self { id, domains })
    }

    /// Membership id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Domains, core first
    pub fn domains(&self) -> &[Arc<DomainMembership>] {
        &self.domains
    }

    /// Find a domain by name
    pub fn domain(&self, name: &str) -> Option<&Arc<DomainMembership>> {
        self.domains.iter().find(|domain| domain.name() == name)
    }

    /// The core domain
    pub fn core_domain(&self) -> Option<&Arc<DomainMembership>> {
        self.domain(CORE_DOMAIN)
    }

    /// Whether the node is listed in the node membership of its domain
    pub fn contains_node(&self, node: &Node) -> bool {
        self.domain(node.domain())
            .and_then(|domain| domain.nodes())
            .is_some_and(|nodes| nodes.contains(&node.id()))
    }

    /// Every worker node, across all worker domains
    pub fn worker_nodes(&self) -> impl Iterator<Item = &Node> {
        self.domains
            .iter()
            .filter(|domain| !domain.is_core())
            .filter_map(|domain| domain.nodes())
            .flat_map(|nodes| nodes.nodes.iter())
    }
}

impl fmt::Display for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.domains.iter().map(|d| d.name()).collect();
        write!(f, "cluster membership {} [{}]", self.id, names.join(", "))
    }
}

/// Delta of one domain: one element delta per registered provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMembershipDelta {
    /// Domain name
    pub name: String,
    /// Element deltas in provider registration order
    pub elements: Vec<ClusterMembershipElementDelta>,
}

/// Delta between two cluster memberships
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembershipDelta {
    /// Membership id after the change
    pub id: u64,
    /// Computed against an absent prior membership
    pub full: bool,
    /// Changed domains only, core first
    pub domains: Vec<DomainMembershipDelta>,
}

impl ClusterMembershipDelta {
    /// Delta of one domain
    pub fn domain(&self, name: &str) -> Option<&DomainMembershipDelta> {
        self.domains.iter().find(|domain| domain.name == name)
    }

    /// Names of the domains touched by the delta
    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.name.as_str()).collect()
    }

    /// Copy restricted to the named domains
    pub fn restricted_to(&self, names: &[&str]) -> Self {
        Self {
            id: self.id,
            full: self.full,
            domains: self
                .domains
                .iter()
                .filter(|domain| names.contains(&domain.name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Observable change of one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMembershipChange {
    /// Domain name
    pub name: String,
    /// Domain did not exist before
    pub new_domain: bool,
    /// Element changes in provider order; `None` where nothing changed
    pub elements: Vec<Option<ClusterMembershipElementChange>>,
}

/// Observable change of the cluster membership
#[derive(Debug, Clone)]
pub struct ClusterMembershipChange {
    /// Membership after the change
    pub membership: Arc<ClusterMembership>,
    /// Delta that produced it
    pub delta: ClusterMembershipDelta,
    /// Per-domain changes
    pub domains: Vec<DomainMembershipChange>,
}
