//! Binding of worker nodes to the core nodes serving them

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::cluster::element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    WorkerToCoreMembership, WorkerToCoreMembershipChange, WorkerToCoreMembershipDelta,
};
use crate::cluster::membership::ClusterMembership;
use crate::cluster::provider::{ClusterMembershipProvider, DeltaContext, ElementDelta};
use crate::error::{MembershipError, MembershipResult};
use crate::group::GroupMembershipManager;
use crate::node::{CORE_DOMAIN, Node, NodeId};

/// Binds every worker to exactly one live core node.
///
/// New workers go to the least loaded core node; workers of a departed core
/// node are rebound the same way.
pub struct WorkerToCoreMembershipProvider {
    group_manager: Option<Arc<GroupMembershipManager>>,
}

impl WorkerToCoreMembershipProvider {
    /// Create the provider used by core nodes
    pub fn new(group_manager: Arc<GroupMembershipManager>) -> Self {
        Self {
            group_manager: Some(group_manager),
        }
    }

    /// Create a provider that only rebuilds received deltas
    pub fn passive() -> Self {
        Self {
            group_manager: None,
        }
    }
}

fn apply(
    old: Option<&WorkerToCoreMembership>,
    delta: &WorkerToCoreMembershipDelta,
) -> WorkerToCoreMembership {
    let mut membership = match (delta.full, old) {
        (false, Some(old)) => old.clone(),
        _ => WorkerToCoreMembership::default(),
    };
    for worker in &delta.unbound {
        membership.bindings.remove(worker);
    }
    membership
        .bindings
        .extend(delta.bound.iter().map(|(worker, core)| (*worker, *core)));
    membership
}

fn least_loaded(cores: &[NodeId], load: &BTreeMap<NodeId, usize>) -> Option<NodeId> {
    cores
        .iter()
        .min_by_key(|core| load.get(*core).copied().unwrap_or(0))
        .copied()
}

impl ClusterMembershipProvider for WorkerToCoreMembershipProvider {
    fn name(&self) -> &str {
        "worker-to-core"
    }

    fn domains(&self, current: Option<&ClusterMembership>) -> BTreeSet<String> {
        let (Some(manager), Some(current)) = (&self.group_manager, current) else {
            return BTreeSet::new();
        };
        let Some(group) = manager.membership() else {
            return BTreeSet::new();
        };

        current
            .domains()
            .iter()
            .filter(|domain| !domain.is_core())
            .filter(|domain| {
                domain.worker_to_core().is_some_and(|bindings| {
                    bindings
                        .bindings
                        .values()
                        .any(|core| !group.group().contains(core))
                })
            })
            .map(|domain| domain.name().to_string())
            .collect()
    }

    fn delta(&self, context: &DeltaContext<'_>) -> MembershipResult<ElementDelta> {
        let old_element = context.old_element;
        if context.domain == CORE_DOMAIN {
            let element = old_element
                .cloned()
                .unwrap_or_else(|| Arc::new(self.empty_element()));
            return Ok((element, None));
        }

        let cores: Vec<NodeId> = context
            .new_core_nodes()
            .map(|nodes| nodes.nodes.iter().map(Node::id).collect())
            .unwrap_or_default();
        let workers: Vec<NodeId> = context
            .new_nodes()
            .map(|nodes| nodes.nodes.iter().map(Node::id).collect())
            .unwrap_or_default();
        let empty = WorkerToCoreMembership::default();
        let old = old_element
            .and_then(|element| element.as_worker_to_core())
            .unwrap_or(&empty);

        let mut delta = WorkerToCoreMembershipDelta {
            full: context.is_full(),
            ..WorkerToCoreMembershipDelta::default()
        };
        delta.unbound = old
            .bindings
            .keys()
            .filter(|worker| !workers.contains(*worker))
            .copied()
            .collect();

        let mut kept = BTreeMap::new();
        let mut unbound_workers = Vec::new();
        for worker in &workers {
            match old.bindings.get(worker) {
                Some(core) if cores.contains(core) => {
                    kept.insert(*worker, *core);
                }
                _ => unbound_workers.push(*worker),
            }
        }

        let mut load = WorkerToCoreMembership {
            bindings: kept.clone(),
        }
        .load();
        for worker in unbound_workers {
            let Some(core) = least_loaded(&cores, &load) else {
                debug!("No core node to bind worker {} to", worker);
                continue;
            };
            *load.entry(core).or_insert(0) += 1;
            delta.bound.insert(worker, core);
        }

        if delta.full {
            delta.bound.extend(kept);
            delta.unbound.clear();
            let element = apply(None, &delta);
            return Ok((
                Arc::new(ClusterMembershipElement::WorkerToCore(element)),
                Some(ClusterMembershipElementDelta::WorkerToCore(delta)),
            ));
        }

        let Some(old_element) = old_element else {
            return Err(MembershipError::invariant(
                "incremental worker to core delta without a prior element",
            ));
        };
        if delta.is_empty() {
            return Ok((old_element.clone(), None));
        }

        let element = apply(Some(old), &delta);
        Ok((
            Arc::new(ClusterMembershipElement::WorkerToCore(element)),
            Some(ClusterMembershipElementDelta::WorkerToCore(delta)),
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
            ClusterMembershipElementDelta::WorkerToCore(delta) => {
                let old = old.and_then(|element| element.as_worker_to_core());
                Ok(Arc::new(ClusterMembershipElement::WorkerToCore(apply(
                    old, delta,
                ))))
            }
            other => Err(MembershipError::invariant(format!(
                "worker to core provider cannot apply {other:?}"
            ))),
        }
    }

    fn create_change(
        &self,
        delta: &ClusterMembershipElementDelta,
        _old: Option<&ClusterMembershipElement>,
        _new: &ClusterMembershipElement,
    ) -> Option<ClusterMembershipElementChange> {
        match delta {
            ClusterMembershipElementDelta::WorkerToCore(delta) => Some(
                ClusterMembershipElementChange::WorkerToCore(WorkerToCoreMembershipChange {
                    bound: delta.bound.clone(),
                    unbound: delta.unbound.clone(),
                }),
            ),
            _ => None,
        }
    }

    fn core_full_delta(&self, element: &ClusterMembershipElement) -> ClusterMembershipElementDelta {
        match element.as_worker_to_core() {
            Some(bindings) => {
                ClusterMembershipElementDelta::WorkerToCore(WorkerToCoreMembershipDelta {
                    full: true,
                    bound: bindings.bindings.clone(),
                    unbound: BTreeSet::new(),
                })
            }
            None => ClusterMembershipElementDelta::Empty,
        }
    }

    fn empty_element(&self) -> ClusterMembershipElement {
        ClusterMembershipElement::WorkerToCore(WorkerToCoreMembership::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_prefers_core_order_on_ties() {
        let cores = [NodeId::from_u128(2), NodeId::from_u128(1)];
        let mut load = BTreeMap::new();
        assert_eq!(least_loaded(&cores, &load), Some(NodeId::from_u128(2)));

        load.insert(NodeId::from_u128(2), 1);
        assert_eq!(least_loaded(&cores, &load), Some(NodeId::from_u128(1)));
        assert_eq!(least_loaded(&[], &load), None);
    }

    #[test]
    fn test_apply_moves_and_drops_bindings() {
        let old = WorkerToCoreMembership {
            bindings: BTreeMap::from([
                (NodeId::from_u128(10), NodeId::from_u128(1)),
                (NodeId::from_u128(11), NodeId::from_u128(2)),
            ]),
        };
        let delta = WorkerToCoreMembershipDelta {
            full: false,
            bound: BTreeMap::from([(NodeId::from_u128(11), NodeId::from_u128(1))]),
            unbound: BTreeSet::from([NodeId::from_u128(10)]),
        };

        let new = apply(Some(&old), &delta);
        assert_eq!(
            new.bindings,
            BTreeMap::from([(NodeId::from_u128(11), NodeId::from_u128(1))])
        );
    }
}
