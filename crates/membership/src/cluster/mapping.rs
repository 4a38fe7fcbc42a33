//! Mapping of worker nodes onto managed groups

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::definition::GroupDefinition;
use super::element::{NodeMembership, NodeMembershipDelta};
use crate::error::MembershipResult;
use crate::group::{Group, GroupDelta};
use crate::node::{Node, NodeId};

/// Which members leave a group holding more nodes than its definition asks for
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// The most recently admitted members leave first
    #[default]
    NewestFirst,
    /// The longest-standing members leave first
    OldestFirst,
}

/// Input of one mapping round for one domain
pub struct MappingInput<'a> {
    /// Domain being mapped
    pub domain: &'a str,
    /// Definitions in force after this round
    pub definitions: &'a BTreeMap<Uuid, GroupDefinition>,
    /// Ids of definitions added, replaced or removed this round
    pub changed_definitions: &'a BTreeSet<Uuid>,
    /// Groups before this round
    pub old_groups: &'a BTreeMap<Uuid, Group>,
    /// Node membership of the domain after this round
    pub nodes: &'a NodeMembership,
    /// Node churn of this round
    pub node_delta: Option<&'a NodeMembershipDelta>,
}

/// One group after mapping; `delta` is `None` for untouched groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMapping {
    /// Group after this round
    pub group: Group,
    /// Change of the group, full for new groups
    pub delta: Option<GroupDelta>,
}

/// Decides group composition from definitions and node churn
pub trait GroupMappingStrategy: Send + Sync {
    /// Map nodes onto groups.
    ///
    /// Returns `None` when neither definitions nor nodes changed. Otherwise
    /// returns one entry per group that exists after the round; groups
    /// missing from the result are dropped.
    fn map(&self, input: &MappingInput<'_>) -> MembershipResult<Option<Vec<GroupMapping>>>;
}

/// Fills groups up to their target size with matching unassigned nodes,
/// in admission order, and evicts surplus members per [`EvictionPolicy`].
/// Every node belongs to at most one group of its domain.
#[derive(Debug, Default, Clone)]
pub struct DefaultGroupMappingStrategy {
    eviction_policy: EvictionPolicy,
}

#[derive(Default)]
struct Draft {
    members: Vec<Node>,
    joined: Vec<Node>,
    left: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
}

impl DefaultGroupMappingStrategy {
    /// Create a strategy with the given eviction policy
    pub fn new(eviction_policy: EvictionPolicy) -> Self {
        Self { eviction_policy }
    }

    /// Eviction policy in use
    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    fn evict(&self, draft: &mut Draft, target: usize) {
        while draft.members.len() > target {
            let evicted = match self.eviction_policy {
                EvictionPolicy::NewestFirst => draft.members.pop(),
                EvictionPolicy::OldestFirst => Some(draft.members.remove(0)),
            };
            if let Some(node) = evicted {
                draft.left.insert(node.id());
            }
        }
    }
}

impl GroupMappingStrategy for DefaultGroupMappingStrategy {
    fn map(&self, input: &MappingInput<'_>) -> MembershipResult<Option<Vec<GroupMapping>>> {
        let churn = input.node_delta.is_some_and(|delta| !delta.is_empty());
        if !churn && input.changed_definitions.is_empty() {
            return Ok(None);
        }

        let present: BTreeSet<NodeId> = input.nodes.nodes.iter().map(Node::id).collect();
        let (left_ids, failed_ids) = match input.node_delta {
            Some(delta) => (delta.left.clone(), delta.failed.clone()),
            None => (BTreeSet::new(), BTreeSet::new()),
        };

        // surviving members first, so that refills never steal a member
        let mut drafts: BTreeMap<Uuid, Draft> = BTreeMap::new();
        let mut assigned: BTreeSet<NodeId> = BTreeSet::new();
        for definition in input.definitions.values() {
            let filter = definition.filter()?;
            let mut draft = Draft::default();

            if let Some(group) = input.old_groups.get(&definition.id) {
                for member in group.members() {
                    let id = member.id();
                    if failed_ids.contains(&id) || (!present.contains(&id) && !left_ids.contains(&id)) {
                        draft.failed.insert(id);
                    } else if left_ids.contains(&id) || !filter.matches(member) {
                        draft.left.insert(id);
                    } else {
                        draft.members.push(member.clone());
                    }
                }
            }

            self.evict(&mut draft, definition.node_count);
            assigned.extend(draft.members.iter().map(Node::id));
            drafts.insert(definition.id, draft);
        }

        let mut mappings = Vec::with_capacity(drafts.len());
        for definition in input.definitions.values() {
            let filter = definition.filter()?;
            let Some(mut draft) = drafts.remove(&definition.id) else {
                continue;
            };

            for node in &input.nodes.nodes {
                if draft.members.len() >= definition.node_count {
                    break;
                }
                if assigned.contains(&node.id()) || !filter.matches(node) {
                    continue;
                }
                assigned.insert(node.id());
                draft.members.push(node.clone());
                draft.joined.push(node.clone());
            }

            match input.old_groups.get(&definition.id) {
                None if draft.members.is_empty() => {
                    debug!(
                        "No eligible node for group {} in domain {}",
                        definition.name, input.domain
                    );
                }
                None => {
                    let group = Group::new(
                        definition.id,
                        1,
                        definition.name.clone(),
                        true,
                        draft.members,
                        definition.group_type.options(),
                    )?;
                    mappings.push(GroupMapping {
                        delta: Some(GroupDelta::full(&group)),
                        group,
                    });
                }
                Some(old) if draft.members.is_empty() => {
                    debug!("Group {} of domain {} lost all members", old.name(), input.domain);
                }
                Some(old) => {
                    let options = definition.group_type.options();
                    let unchanged = draft.joined.is_empty()
                        && draft.left.is_empty()
                        && draft.failed.is_empty()
                        && old.name() == definition.name
                        && *old.options() == options;
                    if unchanged {
                        mappings.push(GroupMapping {
                            group: old.clone(),
                            delta: None,
                        });
                        continue;
                    }

                    let mut delta = GroupDelta::next(old, old.is_primary());
                    delta.name = definition.name.clone();
                    delta.options = options;
                    delta.joined = draft.joined;
                    delta.left = draft.left;
                    delta.failed = draft.failed;

                    let group = old.apply(&delta)?;
                    mappings.push(GroupMapping {
                        group,
                        delta: Some(delta),
                    });
                }
            }
        }

        Ok(Some(mappings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(id: u128, zone: &str) -> Node {
        Node::new(NodeId::from_u128(id), format!("w{id}"), format!("w{id}:1"), "workers")
            .with_property("zone", json!(zone))
    }

    fn nodes(list: &[Node]) -> NodeMembership {
        NodeMembership {
            nodes: list.to_vec(),
        }
    }

    fn definitions(list: &[GroupDefinition]) -> BTreeMap<Uuid, GroupDefinition> {
        list.iter().map(|d| (d.id, d.clone())).collect()
    }

    fn map(
        strategy: &DefaultGroupMappingStrategy,
        definitions: &BTreeMap<Uuid, GroupDefinition>,
        changed: &BTreeSet<Uuid>,
        old_groups: &BTreeMap<Uuid, Group>,
        nodes: &NodeMembership,
        node_delta: Option<&NodeMembershipDelta>,
    ) -> Option<Vec<GroupMapping>> {
        strategy
            .map(&MappingInput {
                domain: "workers",
                definitions,
                changed_definitions: changed,
                old_groups,
                nodes,
                node_delta,
            })
            .unwrap()
    }

    fn ids(group: &Group) -> Vec<u128> {
        group.members().iter().map(|m| m.id().as_uuid().as_u128()).collect()
    }

    #[test]
    fn test_nothing_changed_is_fast_path() {
        let strategy = DefaultGroupMappingStrategy::default();
        let result = map(
            &strategy,
            &BTreeMap::new(),
            &BTreeSet::new(),
            &BTreeMap::new(),
            &nodes(&[worker(1, "a")]),
            Some(&NodeMembershipDelta::default()),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_new_definition_creates_full_group() {
        let strategy = DefaultGroupMappingStrategy::default();
        let definition = GroupDefinition::new("workers", "g", 2).with_filter(r#"zone == "a""#);
        let defs = definitions(&[definition.clone()]);
        let all = nodes(&[worker(1, "b"), worker(2, "a"), worker(3, "a"), worker(4, "a")]);

        let result = map(
            &strategy,
            &defs,
            &BTreeSet::from([definition.id]),
            &BTreeMap::new(),
            &all,
            None,
        )
        .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(ids(&result[0].group), vec![2, 3]);
        assert!(result[0].delta.as_ref().unwrap().full);
    }

    #[test]
    fn test_failed_member_is_replaced() {
        let strategy = DefaultGroupMappingStrategy::default();
        let definition = GroupDefinition::new("workers", "g", 2);
        let defs = definitions(&[definition.clone()]);
        let before = nodes(&[worker(1, "a"), worker(2, "a"), worker(3, "a")]);
        let created = map(
            &strategy,
            &defs,
            &BTreeSet::from([definition.id]),
            &BTreeMap::new(),
            &before,
            None,
        )
        .unwrap();
        let old_groups: BTreeMap<Uuid, Group> =
            created.into_iter().map(|m| (m.group.id(), m.group)).collect();

        let after = nodes(&[worker(2, "a"), worker(3, "a")]);
        let churn = NodeMembershipDelta {
            failed: BTreeSet::from([NodeId::from_u128(1)]),
            ..NodeMembershipDelta::default()
        };
        let result = map(&strategy, &defs, &BTreeSet::new(), &old_groups, &after, Some(&churn)).unwrap();

        let delta = result[0].delta.as_ref().unwrap();
        assert_eq!(ids(&result[0].group), vec![2, 3]);
        assert_eq!(delta.failed, BTreeSet::from([NodeId::from_u128(1)]));
        assert_eq!(delta.joined, vec![worker(3, "a")]);
        assert_eq!(result[0].group.change_id(), 2);
    }

    #[test]
    fn test_untouched_group_has_no_delta() {
        let strategy = DefaultGroupMappingStrategy::default();
        let first = GroupDefinition::new("workers", "first", 1);
        let defs = definitions(&[first.clone()]);
        let all = nodes(&[worker(1, "a")]);
        let created = map(&strategy, &defs, &BTreeSet::from([first.id]), &BTreeMap::new(), &all, None).unwrap();
        let old_groups: BTreeMap<Uuid, Group> =
            created.into_iter().map(|m| (m.group.id(), m.group)).collect();

        // a new node arrives; the full group does not need it
        let grown = nodes(&[worker(1, "a"), worker(2, "a")]);
        let churn = NodeMembershipDelta {
            joined: vec![worker(2, "a")],
            ..NodeMembershipDelta::default()
        };
        let result = map(&strategy, &defs, &BTreeSet::new(), &old_groups, &grown, Some(&churn)).unwrap();

        assert_eq!(result.len(), 1);
        assert!(result[0].delta.is_none());
    }

    #[test]
    fn test_eviction_policies() {
        let members = [worker(1, "a"), worker(2, "a"), worker(3, "a")];
        let wide = GroupDefinition::new("workers", "g", 3);
        let created = map(
            &DefaultGroupMappingStrategy::default(),
            &definitions(&[wide.clone()]),
            &BTreeSet::from([wide.id]),
            &BTreeMap::new(),
            &nodes(&members),
            None,
        )
        .unwrap();
        let old_groups: BTreeMap<Uuid, Group> =
            created.into_iter().map(|m| (m.group.id(), m.group)).collect();

        let mut narrow = wide.clone();
        narrow.node_count = 2;
        let defs = definitions(&[narrow]);
        let changed = BTreeSet::from([wide.id]);

        let newest = map(
            &DefaultGroupMappingStrategy::new(EvictionPolicy::NewestFirst),
            &defs,
            &changed,
            &old_groups,
            &nodes(&members),
            None,
        )
        .unwrap();
        assert_eq!(ids(&newest[0].group), vec![1, 2]);

        let oldest = map(
            &DefaultGroupMappingStrategy::new(EvictionPolicy::OldestFirst),
            &defs,
            &changed,
            &old_groups,
            &nodes(&members),
            None,
        )
        .unwrap();
        assert_eq!(ids(&oldest[0].group), vec![2, 3]);
        assert_eq!(
            oldest[0].delta.as_ref().unwrap().left,
            BTreeSet::from([NodeId::from_u128(1)])
        );
    }

    #[test]
    fn test_graceful_exit_and_removed_definition() {
        let strategy = DefaultGroupMappingStrategy::default();
        let definition = GroupDefinition::new("workers", "g", 1);
        let defs = definitions(&[definition.clone()]);
        let all = nodes(&[worker(1, "a")]);
        let created = map(&strategy, &defs, &BTreeSet::from([definition.id]), &BTreeMap::new(), &all, None).unwrap();
        let old_groups: BTreeMap<Uuid, Group> =
            created.into_iter().map(|m| (m.group.id(), m.group)).collect();

        // the only member leaves: the group is dropped
        let churn = NodeMembershipDelta {
            left: BTreeSet::from([NodeId::from_u128(1)]),
            ..NodeMembershipDelta::default()
        };
        let result = map(&strategy, &defs, &BTreeSet::new(), &old_groups, &nodes(&[]), Some(&churn)).unwrap();
        assert!(result.is_empty());

        // removing the definition drops the group as well
        let result = map(
            &strategy,
            &BTreeMap::new(),
            &BTreeSet::from([definition.id]),
            &old_groups,
            &all,
            None,
        )
        .unwrap();
        assert!(result.is_empty());
    }
}
