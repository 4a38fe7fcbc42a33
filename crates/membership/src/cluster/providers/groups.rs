//! Managed groups of every worker domain

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::definition::GroupDefinition;
use crate::cluster::element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    GroupsMembership, GroupsMembershipChange, GroupsMembershipDelta,
};
use crate::cluster::mapping::{GroupMappingStrategy, MappingInput};
use crate::cluster::membership::ClusterMembership;
use crate::cluster::provider::{ClusterMembershipProvider, DeltaContext, ElementDelta};
use crate::error::{MembershipError, MembershipResult};
use crate::group::GroupChange;
use crate::node::CORE_DOMAIN;

#[derive(Default, Clone)]
struct DefinitionChanges {
    added: Vec<GroupDefinition>,
    removed: BTreeSet<Uuid>,
}

#[derive(Default)]
struct GroupsProviderState {
    pending: BTreeMap<String, DefinitionChanges>,
    round: BTreeMap<String, DefinitionChanges>,
}

/// Maintains the managed groups of worker domains.
///
/// Group composition is recomputed by a [`GroupMappingStrategy`] whenever
/// the node membership of the domain or its group definitions change. The
/// core domain never carries managed groups.
pub struct GroupsMembershipProvider {
    strategy: Arc<dyn GroupMappingStrategy>,
    state: Mutex<GroupsProviderState>,
}

impl GroupsMembershipProvider {
    /// Create the provider
    pub fn new(strategy: Arc<dyn GroupMappingStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(GroupsProviderState::default()),
        }
    }

    /// Queue a definition, added (or replaced) in the next round
    pub fn add_group_definition(&self, definition: GroupDefinition) -> MembershipResult<()> {
        definition.validate()?;
        info!(
            "Adding definition of group {} to domain {}",
            definition.name, definition.domain
        );

        let mut state = self.state.lock();
        let changes = state.pending.entry(definition.domain.clone()).or_default();
        changes.removed.remove(&definition.id);
        changes.added.retain(|existing| existing.id != definition.id);
        changes.added.push(definition);
        Ok(())
    }

    /// Queue removal of a definition, together with its group
    pub fn remove_group_definition(&self, domain: &str, id: Uuid) {
        info!("Removing definition {} from domain {}", id, domain);

        let mut state = self.state.lock();
        let changes = state.pending.entry(domain.to_string()).or_default();
        changes.added.retain(|existing| existing.id != id);
        changes.removed.insert(id);
    }
}

fn apply(old: Option<&GroupsMembership>, delta: &GroupsMembershipDelta) -> MembershipResult<GroupsMembership> {
    let mut membership = match (delta.full, old) {
        (false, Some(old)) => old.clone(),
        _ => GroupsMembership::default(),
    };

    for id in &delta.removed_definitions {
        membership.definitions.remove(id);
    }
    for definition in &delta.added_definitions {
        membership.definitions.insert(definition.id, definition.clone());
    }
    for id in &delta.removed_groups {
        membership.groups.remove(id);
    }
    for group_delta in &delta.groups {
        let group = if group_delta.full {
            group_delta.create_group()?
        } else {
            membership
                .groups
                .get(&group_delta.group_id)
                .ok_or_else(|| {
                    MembershipError::invariant(format!(
                        "incremental delta for unknown group {}",
                        group_delta.group_id
                    ))
                })?
                .apply(group_delta)?
        };
        membership.groups.insert(group.id(), group);
    }

    Ok(membership)
}

impl ClusterMembershipProvider for GroupsMembershipProvider {
    fn name(&self) -> &str {
        "groups"
    }

    fn domains(&self, _current: Option<&ClusterMembership>) -> BTreeSet<String> {
        let mut state = self.state.lock();
        state.round = std::mem::take(&mut state.pending);
        state.round.keys().cloned().collect()
    }

    fn delta(&self, context: &DeltaContext<'_>) -> MembershipResult<ElementDelta> {
        if context.domain == CORE_DOMAIN {
            let element = context
                .old_element
                .cloned()
                .unwrap_or_else(|| Arc::new(self.empty_element()));
            return Ok((element, None));
        }

        let changes = self
            .state
            .lock()
            .round
            .get(context.domain)
            .cloned()
            .unwrap_or_default();
        let empty = GroupsMembership::default();
        let old = context
            .old_element
            .and_then(|element| element.as_groups())
            .unwrap_or(&empty);

        let mut definitions = old.definitions.clone();
        let mut changed_definitions = BTreeSet::new();
        for id in &changes.removed {
            if definitions.remove(id).is_some() {
                changed_definitions.insert(*id);
            }
        }
        for definition in &changes.added {
            changed_definitions.insert(definition.id);
            definitions.insert(definition.id, definition.clone());
        }

        let nodes = context.new_nodes().cloned().unwrap_or_default();
        let mappings = self.strategy.map(&MappingInput {
            domain: context.domain,
            definitions: &definitions,
            changed_definitions: &changed_definitions,
            old_groups: &old.groups,
            nodes: &nodes,
            node_delta: context.node_delta(),
        })?;

        let mut delta = GroupsMembershipDelta {
            full: context.is_full(),
            added_definitions: changes
                .added
                .iter()
                .filter(|d| changed_definitions.contains(&d.id))
                .cloned()
                .collect(),
            removed_definitions: changes
                .removed
                .iter()
                .filter(|id| old.definitions.contains_key(*id) && !definitions.contains_key(*id))
                .copied()
                .collect(),
            ..GroupsMembershipDelta::default()
        };

        if let Some(mappings) = &mappings {
            let kept: BTreeSet<Uuid> = mappings.iter().map(|m| m.group.id()).collect();
            delta.removed_groups = old
                .groups
                .keys()
                .filter(|id| !kept.contains(*id))
                .copied()
                .collect();
            delta.groups = mappings.iter().filter_map(|m| m.delta.clone()).collect();
        }

        if delta.full {
            // a full delta restates every definition and group
            delta.added_definitions = definitions.values().cloned().collect();
            delta.removed_definitions.clear();
            delta.removed_groups.clear();
            let element = apply(None, &delta)?;
            return Ok((
                Arc::new(ClusterMembershipElement::Groups(element)),
                Some(ClusterMembershipElementDelta::Groups(delta)),
            ));
        }

        let Some(old_element) = context.old_element else {
            return Err(MembershipError::invariant("incremental groups delta without a prior element"));
        };
        if delta.is_empty() {
            return Ok((old_element.clone(), None));
        }

        debug!(
            "Domain {}: {} groups changed, {} removed",
            context.domain,
            delta.groups.len(),
            delta.removed_groups.len()
        );
        let element = apply(Some(old), &delta)?;
        Ok((
            Arc::new(ClusterMembershipElement::Groups(element)),
            Some(ClusterMembershipElementDelta::Groups(delta)),
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
            ClusterMembershipElementDelta::Groups(delta) => {
                let old = old.and_then(|element| element.as_groups());
                Ok(Arc::new(ClusterMembershipElement::Groups(apply(old, delta)?)))
            }
            other => Err(MembershipError::invariant(format!(
                "groups membership provider cannot apply {other:?}"
            ))),
        }
    }

    fn create_change(
        &self,
        delta: &ClusterMembershipElementDelta,
        old: Option<&ClusterMembershipElement>,
        new: &ClusterMembershipElement,
    ) -> Option<ClusterMembershipElementChange> {
        let ClusterMembershipElementDelta::Groups(delta) = delta else {
            return None;
        };
        let old = old.and_then(|element| element.as_groups());
        let new = new.as_groups()?;

        let mut change = GroupsMembershipChange {
            new_groups: Vec::new(),
            changed_groups: Vec::new(),
            removed_groups: Vec::new(),
        };
        for group_delta in &delta.groups {
            let Some(group) = new.groups.get(&group_delta.group_id) else {
                continue;
            };
            let previous = old.and_then(|old| old.groups.get(&group_delta.group_id));
            match previous {
                Some(previous) if !group_delta.full => {
                    change
                        .changed_groups
                        .push(GroupChange::new(previous, group.clone(), group_delta));
                }
                _ => change.new_groups.push(group.clone()),
            }
        }
        if let Some(old) = old {
            change.removed_groups = delta
                .removed_groups
                .iter()
                .filter_map(|id| old.groups.get(id).cloned())
                .collect();
        }

        Some(ClusterMembershipElementChange::Groups(change))
    }

    fn core_full_delta(&self, element: &ClusterMembershipElement) -> ClusterMembershipElementDelta {
        match element.as_groups() {
            Some(groups) => ClusterMembershipElementDelta::Groups(GroupsMembershipDelta {
                full: true,
                groups: groups.groups.values().map(crate::group::GroupDelta::full).collect(),
                added_definitions: groups.definitions.values().cloned().collect(),
                ..GroupsMembershipDelta::default()
            }),
            None => ClusterMembershipElementDelta::Empty,
        }
    }

    fn empty_element(&self) -> ClusterMembershipElement {
        ClusterMembershipElement::Groups(GroupsMembership::default())
    }
}
