//! Coordinator decision loop requesting new group memberships

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::manager::GroupMembershipManager;
use super::membership::{GroupMembership, GroupMembershipDelta};
use super::primary::is_primary_partition;
use super::types::{CORE_GROUP_ID, CORE_GROUP_NAME, Group, GroupDelta, GroupOption};
use crate::clock::PeriodGate;
use crate::collaborators::{FailureDetector, FlushCondition, FlushCoordinator};
use crate::discovery::NodeDiscovery;
use crate::error::MembershipResult;
use crate::node::{Node, NodeId};

/// What a tracking tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackDecision {
    /// Nothing to do this tick
    Idle,
    /// Installation of the first membership was requested
    RequestedInstall(u64),
    /// Installation of the next membership was requested
    RequestedChange(u64),
    /// The flush condition vetoed the change
    Vetoed,
}

/// Periodically decides whether the core group needs a new membership.
///
/// The tracker only asks the flush coordinator to install; the manager is
/// updated once the flush completes.
pub struct GroupMembershipTracker {
    manager: Arc<GroupMembershipManager>,
    failure_detector: Arc<dyn FailureDetector>,
    flush: Arc<dyn FlushCoordinator>,
    flush_condition: Option<Arc<dyn FlushCondition>>,
    gate: PeriodGate,
    pending_joins: BTreeSet<Node>,
    exit_requested: bool,
}

impl GroupMembershipTracker {
    /// Create a tracker for the group held by `manager`
    pub fn new(
        manager: Arc<GroupMembershipManager>,
        failure_detector: Arc<dyn FailureDetector>,
        flush: Arc<dyn FlushCoordinator>,
        flush_condition: Option<Arc<dyn FlushCondition>>,
        track_period_ms: u64,
    ) -> Self {
        Self {
            manager,
            failure_detector,
            flush,
            flush_condition,
            gate: PeriodGate::new(track_period_ms),
            pending_joins: BTreeSet::new(),
            exit_requested: false,
        }
    }

    /// Stop requesting memberships
    pub fn request_exit(&mut self) {
        info!("Group membership tracker of {} exiting", self.manager.local_node());
        self.exit_requested = true;
    }

    /// Whether an exit was requested
    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested
    }

    /// Nodes discovered but not yet admitted
    pub fn pending_joins(&self) -> &BTreeSet<Node> {
        &self.pending_joins
    }

    /// One tracking tick
    pub fn on_timer(
        &mut self,
        now_ms: u64,
        discovery: &mut dyn NodeDiscovery,
    ) -> MembershipResult<TrackDecision> {
        if self.exit_requested || !self.gate.try_pass(now_ms) {
            return Ok(TrackDecision::Idle);
        }
        if self.flush.is_flush_in_progress() || self.manager.has_outstanding_change() {
            return Ok(TrackDecision::Idle);
        }

        match self.manager.membership() {
            None => self.track_formation(now_ms, discovery),
            Some(membership) => {
                if !self.is_coordinator(&membership) {
                    return Ok(TrackDecision::Idle);
                }
                self.track_change(&membership, discovery)
            }
        }
    }

    fn is_coordinator(&self, membership: &GroupMembership) -> bool {
        let local_id = self.manager.local_node().id();
        match self.failure_detector.current_coordinator() {
            Some(coordinator) => coordinator.id() == local_id,
            None => membership.group().coordinator().id() == local_id,
        }
    }

    fn track_formation(
        &mut self,
        now_ms: u64,
        discovery: &mut dyn NodeDiscovery,
    ) -> MembershipResult<TrackDecision> {
        if !discovery.can_form_group(now_ms) {
            return Ok(TrackDecision::Idle);
        }

        let local = self.manager.local_node().clone();
        let peers: BTreeSet<Node> = discovery
            .take_discovered_nodes()
            .into_iter()
            .chain(std::mem::take(&mut self.pending_joins))
            .filter(|node| node.id() != local.id() && node.is_core())
            .collect();

        let mut members = Vec::with_capacity(peers.len() + 1);
        members.push(local);
        members.extend(peers);

        let group = Group::new(
            CORE_GROUP_ID,
            1,
            CORE_GROUP_NAME,
            true,
            members,
            BTreeSet::from([GroupOption::Core]),
        )?;
        let membership = GroupMembership::new(1, group)?;

        info!("Requesting formation of {}", membership);
        self.flush.install(membership, None)?;

        Ok(TrackDecision::RequestedInstall(1))
    }

    fn track_change(
        &mut self,
        membership: &GroupMembership,
        discovery: &mut dyn NodeDiscovery,
    ) -> MembershipResult<TrackDecision> {
        let group = membership.group();
        let member_ids: BTreeSet<NodeId> = group.members().iter().map(Node::id).collect();
        let local_id = self.manager.local_node().id();

        let failed: BTreeSet<NodeId> = self
            .failure_detector
            .failed_members()
            .iter()
            .map(Node::id)
            .filter(|id| member_ids.contains(id) && *id != local_id)
            .collect();
        let left: BTreeSet<NodeId> = self
            .failure_detector
            .left_members()
            .iter()
            .map(Node::id)
            .filter(|id| member_ids.contains(id) && *id != local_id)
            .collect();

        self.pending_joins.extend(discovery.take_discovered_nodes());
        self.pending_joins
            .retain(|node| node.is_core() && !member_ids.contains(&node.id()));

        let joined: Vec<Node> = self
            .pending_joins
            .iter()
            .filter(|node| !failed.contains(&node.id()) && !left.contains(&node.id()))
            .cloned()
            .collect();

        if failed.is_empty() && left.is_empty() && joined.is_empty() {
            return Ok(TrackDecision::Idle);
        }

        let primary = is_primary_partition(group.is_primary(), group.members(), &failed, &left);
        if group.is_primary() && !primary {
            warn!(
                "Group {} lost primary status ({} failed, {} left)",
                group.name(),
                failed.len(),
                left.len()
            );
        }

        let mut group_delta = GroupDelta::next(group, primary);
        group_delta.joined = joined;
        group_delta.failed = failed;
        group_delta.left = left;

        let delta = GroupMembershipDelta {
            id: membership.id() + 1,
            group: group_delta,
        };
        let next = membership.apply(&delta)?;

        let approved = self
            .flush_condition
            .as_ref()
            .is_none_or(|condition| condition.can_start_flush(membership, &delta));
        if !approved {
            debug!("Flush condition vetoed change to {}", next);
            return Ok(TrackDecision::Vetoed);
        }

        info!(
            "Requesting change to {} (joined {}, failed {}, left {})",
            next,
            delta.group.joined.len(),
            delta.group.failed.len(),
            delta.group.left.len()
        );
        let next_id = next.id();
        self.flush.install(next, Some(delta))?;

        Ok(TrackDecision::RequestedChange(next_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CORE_DOMAIN;
    use parking_lot::Mutex;

    fn node(id: u128) -> Node {
        Node::new(NodeId::from_u128(id), format!("n{id}"), format!("n{id}:1"), CORE_DOMAIN)
    }

    #[derive(Default)]
    struct StubDetector {
        failed: Mutex<BTreeSet<Node>>,
        coordinator: Mutex<Option<Node>>,
    }

    impl FailureDetector for StubDetector {
        fn failed_members(&self) -> BTreeSet<Node> {
            self.failed.lock().clone()
        }

        fn left_members(&self) -> BTreeSet<Node> {
            BTreeSet::new()
        }

        fn healthy_members(&self) -> BTreeSet<Node> {
            BTreeSet::new()
        }

        fn current_coordinator(&self) -> Option<Node> {
            self.coordinator.lock().clone()
        }
    }

    /// Applies requested memberships immediately
    struct DirectFlush {
        manager: Arc<GroupMembershipManager>,
    }

    impl FlushCoordinator for DirectFlush {
        fn install(
            &self,
            membership: GroupMembership,
            delta: Option<GroupMembershipDelta>,
        ) -> MembershipResult<()> {
            match delta {
                None => self.manager.prepare_install(membership)?,
                Some(delta) => self.manager.prepare_change(membership, &delta)?,
            }
            self.manager.commit()
        }

        fn is_flush_in_progress(&self) -> bool {
            false
        }
    }

    struct Veto;

    impl FlushCondition for Veto {
        fn can_start_flush(&self, _current: &GroupMembership, _delta: &GroupMembershipDelta) -> bool {
            false
        }
    }

    struct StubDiscovery {
        can_form: bool,
        discovered: BTreeSet<Node>,
    }

    impl NodeDiscovery for StubDiscovery {
        fn can_form_group(&self, _now_ms: u64) -> bool {
            self.can_form
        }

        fn take_discovered_nodes(&mut self) -> BTreeSet<Node> {
            std::mem::take(&mut self.discovered)
        }
    }

    fn tracker(
        local: u128,
        condition: Option<Arc<dyn FlushCondition>>,
    ) -> (GroupMembershipTracker, Arc<GroupMembershipManager>, Arc<StubDetector>) {
        let manager = Arc::new(GroupMembershipManager::new(node(local)));
        let detector = Arc::new(StubDetector::default());
        let flush = Arc::new(DirectFlush {
            manager: manager.clone(),
        });
        let tracker =
            GroupMembershipTracker::new(manager.clone(), detector.clone(), flush, condition, 100);
        (tracker, manager, detector)
    }

    #[test]
    fn test_forms_group_with_discovered_nodes() {
        let (mut tracker, manager, _) = tracker(1, None);
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::from([node(3), node(2)]),
        };

        let decision = tracker.on_timer(0, &mut discovery).unwrap();
        assert_eq!(decision, TrackDecision::RequestedInstall(1));

        let membership = manager.membership().unwrap();
        let ids: Vec<_> = membership.group().members().iter().map(Node::id).collect();
        assert_eq!(
            ids,
            vec![NodeId::from_u128(1), NodeId::from_u128(2), NodeId::from_u128(3)]
        );
        assert!(membership.group().is_primary());
    }

    #[test]
    fn test_waits_for_formation_gate() {
        let (mut tracker, manager, _) = tracker(2, None);
        let mut discovery = StubDiscovery {
            can_form: false,
            discovered: BTreeSet::from([node(1)]),
        };

        assert_eq!(tracker.on_timer(0, &mut discovery).unwrap(), TrackDecision::Idle);
        assert!(manager.membership().is_none());
    }

    #[test]
    fn test_failed_member_produces_next_membership() {
        let (mut tracker, manager, detector) = tracker(1, None);
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::from([node(2), node(3)]),
        };
        tracker.on_timer(0, &mut discovery).unwrap();

        detector.failed.lock().insert(node(3));
        // gated by the track period
        assert_eq!(tracker.on_timer(50, &mut discovery).unwrap(), TrackDecision::Idle);
        assert_eq!(
            tracker.on_timer(100, &mut discovery).unwrap(),
            TrackDecision::RequestedChange(2)
        );

        let membership = manager.membership().unwrap();
        assert_eq!(membership.id(), 2);
        assert_eq!(membership.group().members().len(), 2);
        assert!(membership.group().is_primary());
    }

    #[test]
    fn test_non_coordinator_stays_idle() {
        let (mut tracker, _, detector) = tracker(1, None);
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::from([node(2)]),
        };
        tracker.on_timer(0, &mut discovery).unwrap();

        detector.failed.lock().insert(node(2));
        *detector.coordinator.lock() = Some(node(2));

        assert_eq!(tracker.on_timer(100, &mut discovery).unwrap(), TrackDecision::Idle);
    }

    #[test]
    fn test_late_discovered_node_joins() {
        let (mut tracker, manager, _) = tracker(1, None);
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::new(),
        };
        tracker.on_timer(0, &mut discovery).unwrap();

        discovery.discovered.insert(node(4));
        assert_eq!(
            tracker.on_timer(100, &mut discovery).unwrap(),
            TrackDecision::RequestedChange(2)
        );
        assert!(manager.membership().unwrap().group().contains(&NodeId::from_u128(4)));
        assert!(tracker.pending_joins().contains(&node(4)));

        // admitted nodes are dropped from the pending set on the next tick
        assert_eq!(tracker.on_timer(200, &mut discovery).unwrap(), TrackDecision::Idle);
        assert!(tracker.pending_joins().is_empty());
    }

    #[test]
    fn test_flush_condition_can_veto() {
        let (mut tracker, manager, detector) = tracker(1, Some(Arc::new(Veto)));
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::from([node(2)]),
        };
        tracker.on_timer(0, &mut discovery).unwrap();

        detector.failed.lock().insert(node(2));
        assert_eq!(tracker.on_timer(100, &mut discovery).unwrap(), TrackDecision::Vetoed);
        assert_eq!(manager.membership().unwrap().id(), 1);
    }

    #[test]
    fn test_exit_stops_tracking() {
        let (mut tracker, manager, _) = tracker(1, None);
        let mut discovery = StubDiscovery {
            can_form: true,
            discovered: BTreeSet::new(),
        };

        tracker.request_exit();
        assert_eq!(tracker.on_timer(0, &mut discovery).unwrap(), TrackDecision::Idle);
        assert!(manager.membership().is_none());
    }
}
