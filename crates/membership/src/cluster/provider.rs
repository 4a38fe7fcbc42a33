//! Pluggable providers of cluster membership elements

use std::collections::BTreeSet;
use std::sync::Arc;

use super::element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    NodeMembership, NodeMembershipDelta,
};
use super::membership::{ClusterMembership, DomainMembership};
use crate::error::MembershipResult;
use crate::node::{CORE_DOMAIN, Node};

/// Element plus delta returned by [`ClusterMembershipProvider::delta`];
/// a `None` delta means the element is unchanged
pub type ElementDelta = (
    Arc<ClusterMembershipElement>,
    Option<ClusterMembershipElementDelta>,
);

/// Everything a provider may look at while computing its delta for a domain
pub struct DeltaContext<'a> {
    /// Id of the membership being built
    pub membership_id: u64,
    /// Domain being computed
    pub domain: &'a str,
    /// Previous cluster membership
    pub old_membership: Option<&'a ClusterMembership>,
    /// Previous membership of the domain
    pub old_domain: Option<&'a DomainMembership>,
    /// Previous element of this provider in the domain
    pub old_element: Option<&'a Arc<ClusterMembershipElement>>,
    /// Elements already computed for this domain by earlier providers
    pub new_elements: &'a [Arc<ClusterMembershipElement>],
    /// Deltas already computed for this domain by earlier providers
    pub deltas: &'a [ClusterMembershipElementDelta],
    /// Elements of the core domain in the membership being built; absent
    /// while the core domain itself is computed
    pub new_core_elements: Option<&'a [Arc<ClusterMembershipElement>]>,
}

impl DeltaContext<'_> {
    /// New node membership of this domain, computed by an earlier provider
    pub fn new_nodes(&self) -> Option<&NodeMembership> {
        self.new_elements.iter().find_map(|element| element.as_node())
    }

    /// Node delta of this domain, computed by an earlier provider
    pub fn node_delta(&self) -> Option<&NodeMembershipDelta> {
        self.deltas.iter().find_map(|delta| delta.as_node())
    }

    /// New node membership of the core domain
    pub fn new_core_nodes(&self) -> Option<&NodeMembership> {
        match self.new_core_elements {
            Some(elements) => elements.iter().find_map(|element| element.as_node()),
            None if self.domain == CORE_DOMAIN => self.new_nodes(),
            None => None,
        }
    }

    /// Whether the domain is computed without a prior element
    pub fn is_full(&self) -> bool {
        self.old_element.is_none()
    }
}

/// Strategy object owning one element of every domain membership.
///
/// Providers are invoked once per domain per round in registration order.
/// All methods run on the compartment; interior state is only used to carry
/// pending changes between [`domains`](Self::domains) and
/// [`delta`](Self::delta).
pub trait ClusterMembershipProvider: Send + Sync {
    /// Provider name, for logging
    fn name(&self) -> &str;

    /// Domains with pending changes.
    ///
    /// Snapshots (drains) the pending state for the round; a second call in
    /// the same round must not report the same changes again.
    fn domains(&self, current: Option<&ClusterMembership>) -> BTreeSet<String>;

    /// Compute the element of one domain and its delta
    fn delta(&self, context: &DeltaContext<'_>) -> MembershipResult<ElementDelta>;

    /// Rebuild an element from a delta and the prior element
    fn create_membership(
        &self,
        delta: &ClusterMembershipElementDelta,
        old: Option<&Arc<ClusterMembershipElement>>,
    ) -> MembershipResult<Arc<ClusterMembershipElement>>;

    /// Observable change between two elements produced by `delta`
    fn create_change(
        &self,
        delta: &ClusterMembershipElementDelta,
        old: Option<&ClusterMembershipElement>,
        new: &ClusterMembershipElement,
    ) -> Option<ClusterMembershipElementChange>;

    /// Full delta recreating `element` from nothing
    fn core_full_delta(&self, element: &ClusterMembershipElement)
    -> ClusterMembershipElementDelta;

    /// Full delta of `element` as published to a worker node
    fn worker_delta(
        &self,
        element: &ClusterMembershipElement,
        _worker: &Node,
    ) -> ClusterMembershipElementDelta {
        self.core_full_delta(element)
    }

    /// Element of a domain this provider has nothing for
    fn empty_element(&self) -> ClusterMembershipElement;
}
