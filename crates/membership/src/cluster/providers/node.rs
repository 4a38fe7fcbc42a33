//! Node membership of every domain

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cluster::element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    NodeMembership, NodeMembershipChange, NodeMembershipDelta,
};
use crate::cluster::membership::ClusterMembership;
use crate::cluster::provider::{ClusterMembershipProvider, DeltaContext, ElementDelta};
use crate::collaborators::FailureDetector;
use crate::discovery::ClusterNodeDiscovery;
use crate::error::{MembershipError, MembershipResult};
use crate::group::GroupMembershipManager;
use crate::node::{CORE_DOMAIN, Node, NodeId};

struct NodeSources {
    group_manager: Arc<GroupMembershipManager>,
    cluster_discovery: Arc<ClusterNodeDiscovery>,
    worker_failure_detector: Option<Arc<dyn FailureDetector>>,
}

#[derive(Default)]
struct PendingNodes {
    core_members: Option<Vec<Node>>,
    joined: BTreeSet<Node>,
    left: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
}

#[derive(Default)]
struct NodeProviderState {
    exit_requests: BTreeSet<Node>,
    round: BTreeMap<String, PendingNodes>,
}

/// Tracks which nodes belong to each domain.
///
/// The core domain mirrors the core group membership. Worker domains grow
/// from admitted join requests and shrink on failures reported by the
/// worker failure detector and on graceful exit requests.
pub struct NodeMembershipProvider {
    sources: Option<NodeSources>,
    state: Mutex<NodeProviderState>,
}

impl NodeMembershipProvider {
    /// Create the provider used by core nodes
    pub fn new(
        group_manager: Arc<GroupMembershipManager>,
        cluster_discovery: Arc<ClusterNodeDiscovery>,
        worker_failure_detector: Option<Arc<dyn FailureDetector>>,
    ) -> Self {
        Self {
            sources: Some(NodeSources {
                group_manager,
                cluster_discovery,
                worker_failure_detector,
            }),
            state: Mutex::new(NodeProviderState::default()),
        }
    }

    /// Create a provider that only rebuilds received deltas
    pub fn passive() -> Self {
        Self {
            sources: None,
            state: Mutex::new(NodeProviderState::default()),
        }
    }

    /// Record a graceful exit of `node`, processed in the next round
    pub fn request_exit(&self, node: Node) {
        info!("Exit of {} from domain {} requested", node, node.domain());
        self.state.lock().exit_requests.insert(node);
    }

    fn removed_core_member(state: &NodeProviderState, node: &Node, change: &mut NodeMembershipDelta) {
        if state.exit_requests.contains(node) {
            change.left.insert(node.id());
        } else {
            change.failed.insert(node.id());
        }
    }
}

fn apply(old: Option<&NodeMembership>, delta: &NodeMembershipDelta) -> NodeMembership {
    if delta.full {
        return NodeMembership {
            nodes: delta.joined.clone(),
        };
    }

    let removed = delta.removed();
    let mut nodes: Vec<Node> = old
        .map(|membership| {
            membership
                .nodes
                .iter()
                .filter(|node| !removed.contains(&node.id()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    for node in &delta.joined {
        if !nodes.contains(node) {
            nodes.push(node.clone());
        }
    }

    NodeMembership { nodes }
}

impl ClusterMembershipProvider for NodeMembershipProvider {
    fn name(&self) -> &str {
        "nodes"
    }

    fn domains(&self, current: Option<&ClusterMembership>) -> BTreeSet<String> {
        let Some(sources) = &self.sources else {
            return BTreeSet::new();
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.round.clear();

        let members_of = |domain: &str| -> BTreeSet<NodeId> {
            current
                .and_then(|membership| membership.domain(domain))
                .and_then(|domain| domain.nodes())
                .map(|nodes| nodes.nodes.iter().map(Node::id).collect())
                .unwrap_or_default()
        };

        if let Some(group) = sources.group_manager.membership() {
            let members = group.group().members().to_vec();
            let ids: BTreeSet<NodeId> = members.iter().map(Node::id).collect();
            if current.is_none() || ids != members_of(CORE_DOMAIN) {
                state.round.entry(CORE_DOMAIN.to_string()).or_default().core_members =
                    Some(members);
            }
        }

        for (domain, nodes) in sources.cluster_discovery.take_joining_nodes() {
            let existing = members_of(&domain);
            let fresh: BTreeSet<Node> = nodes
                .into_iter()
                .filter(|node| !existing.contains(&node.id()))
                .collect();
            if !fresh.is_empty() {
                state.round.entry(domain).or_default().joined.extend(fresh);
            }
        }

        let is_member = |node: &Node| current.is_some_and(|membership| membership.contains_node(node));

        if let Some(detector) = &sources.worker_failure_detector {
            for node in detector.failed_members() {
                if !node.is_core() && is_member(&node) {
                    state.round.entry(node.domain().to_string()).or_default().failed.insert(node.id());
                }
            }
            for node in detector.left_members() {
                if !node.is_core() && is_member(&node) {
                    state.round.entry(node.domain().to_string()).or_default().left.insert(node.id());
                }
            }
        }

        state.exit_requests.retain(|node| is_member(node));
        for node in state.exit_requests.iter().filter(|node| !node.is_core()) {
            state.round.entry(node.domain().to_string()).or_default().left.insert(node.id());
        }

        state.round.keys().cloned().collect()
    }

    fn delta(&self, context: &DeltaContext<'_>) -> MembershipResult<ElementDelta> {
        let state = self.state.lock();
        let old = context.old_element.and_then(|element| element.as_node());
        let old_nodes: &[Node] = old.map(|membership| membership.nodes.as_slice()).unwrap_or(&[]);
        let known = |id: &NodeId| old_nodes.iter().any(|node| node.id() == *id);

        let mut change = NodeMembershipDelta::default();
        if let Some(pending) = state.round.get(context.domain) {
            if let Some(members) = &pending.core_members {
                let target: BTreeSet<NodeId> = members.iter().map(Node::id).collect();
                change.joined = members.iter().filter(|m| !known(&m.id())).cloned().collect();
                for node in old_nodes.iter().filter(|n| !target.contains(&n.id())) {
                    Self::removed_core_member(&state, node, &mut change);
                }
            }

            let removed: BTreeSet<NodeId> = pending.left.union(&pending.failed).copied().collect();
            for node in &pending.joined {
                if !known(&node.id()) && !removed.contains(&node.id()) && !change.joined.contains(node) {
                    change.joined.push(node.clone());
                }
            }
            change.left.extend(pending.left.iter().filter(|id| known(*id)));
            change
                .failed
                .extend(pending.failed.iter().filter(|id| known(*id) && !pending.left.contains(*id)));
        }

        let Some(old_element) = context.old_element else {
            let nodes = apply(None, &change);
            let delta = NodeMembershipDelta {
                full: true,
                joined: nodes.nodes.clone(),
                ..NodeMembershipDelta::default()
            };
            return Ok((
                Arc::new(ClusterMembershipElement::Node(nodes)),
                Some(ClusterMembershipElementDelta::Node(delta)),
            ));
        };

        if change.is_empty() {
            return Ok((old_element.clone(), None));
        }

        debug!(
            "Domain {}: {} joined, {} left, {} failed",
            context.domain,
            change.joined.len(),
            change.left.len(),
            change.failed.len()
        );
        let nodes = apply(old, &change);
        Ok((
            Arc::new(ClusterMembershipElement::Node(nodes)),
            Some(ClusterMembershipElementDelta::Node(change)),
        ))
    }

    fn create_membership(
        &self,
        delta: &ClusterMembershipElementDelta,
        old: Option<&Arc<ClusterMembershipElement>>,
    ) -> MembershipResult<Arc<ClusterMembershipElement>> {
        match delta {
            ClusterMembershipElementDelta::Empty => Ok(old
                .cloned()
                .unwrap_or_else(|| Arc::new(self.empty_element()))),
            ClusterMembershipElementDelta::Node(delta) => {
                let old = old.and_then(|element| element.as_node());
                Ok(Arc::new(ClusterMembershipElement::Node(apply(old, delta))))
            }
            other => Err(MembershipError::invariant(format!(
                "node membership provider cannot apply {other:?}"
            ))),
        }
    }

    fn create_change(
        &self,
        delta: &ClusterMembershipElementDelta,
        old: Option<&ClusterMembershipElement>,
        _new: &ClusterMembershipElement,
    ) -> Option<ClusterMembershipElementChange> {
        let ClusterMembershipElementDelta::Node(delta) = delta else {
            return None;
        };
        let old_nodes = old.and_then(|element| element.as_node());
        let resolve = |ids: &BTreeSet<NodeId>| -> Vec<Node> {
            old_nodes
                .map(|nodes| {
                    nodes
                        .nodes
                        .iter()
                        .filter(|node| ids.contains(&node.id()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        Some(ClusterMembershipElementChange::Node(NodeMembershipChange {
            joined: delta.joined.clone(),
            left: resolve(&delta.left),
            failed: resolve(&delta.failed),
        }))
    }

    fn core_full_delta(&self, element: &ClusterMembershipElement) -> ClusterMembershipElementDelta {
        match element.as_node() {
            Some(nodes) => ClusterMembershipElementDelta::Node(NodeMembershipDelta {
                full: true,
                joined: nodes.nodes.clone(),
                ..NodeMembershipDelta::default()
            }),
            None => ClusterMembershipElementDelta::Empty,
        }
    }

    fn empty_element(&self) -> ClusterMembershipElement {
        ClusterMembershipElement::Node(NodeMembership::default())
    }
}
