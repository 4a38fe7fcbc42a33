//! Core group formation, churn and cluster membership agreement

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{STEP_MS, TestCluster, core_node};
use proven_membership::discovery::DiscoveryState;
use proven_membership::group::CORE_GROUP_ID;
use proven_membership::message::{ClusterMembershipMessagePart, ClusterMembershipResponseMessagePart};
use proven_membership::{
    ClusterMembershipChange, ClusterMembershipListener, Destination, ListenerError,
    ListenerResult, Message, MessagePart, NodeId, ProtocolStack,
};
use tracing_test::traced_test;

fn ids(values: &[u128]) -> Vec<NodeId> {
    values.iter().map(|id| NodeId::from_u128(*id)).collect()
}

#[test]
#[traced_test]
fn test_three_core_nodes_form_one_group() {
    let cluster = TestCluster::formed(3);

    for id in 1..=3 {
        assert_eq!(cluster.group_membership_id(id), Some(1));
        let membership = cluster.cluster_membership(id).unwrap();
        assert_eq!(membership.id(), 1);
        assert_eq!(TestCluster::core_ids(&membership), ids(&[1, 2, 3]));
    }

    let coordinator = cluster.coordinator();
    assert_eq!(coordinator.node, core_node(1));
    assert!(coordinator.stack.group_manager().is_coordinator());
    assert_eq!(coordinator.stack.core_protocol().outstanding_round(), None);
}

#[test]
fn test_lowest_id_forms_the_group() {
    let mut cluster = TestCluster::new(3);

    // nobody forms before the formation period elapsed
    cluster.run_for(50);
    assert!((1..=3).all(|id| cluster.group_membership_id(id).is_none()));

    assert!(cluster.run_until(3000, |c| c.cores_agree(&[1, 2, 3], 1)));
    let membership = cluster.core(2).stack.group_manager().membership().unwrap();
    assert_eq!(membership.group().coordinator(), &core_node(1));
    assert_eq!(cluster.flush.install_count(), 1);
}

#[test]
#[traced_test]
fn test_core_node_joins_running_group() {
    let mut cluster = TestCluster::formed(3);

    cluster.add_core(4);
    assert!(
        cluster.run_until(2000, |c| c.cores_agree(&[1, 2, 3, 4], 2)),
        "new core node was not admitted"
    );

    assert_eq!(cluster.group_membership_id(4), Some(2));
    let membership = cluster.cluster_membership(4).unwrap();
    assert_eq!(membership.id(), 2);
    assert_eq!(TestCluster::core_ids(&membership), ids(&[1, 2, 3, 4]));
    assert_eq!(cluster.store.saved_id(CORE_GROUP_ID), Some(2));
}

#[test]
#[traced_test]
fn test_coordinator_failure_hands_over() {
    let mut cluster = TestCluster::formed(3);

    cluster.kill_core(1);
    cluster.failure_detector.set_coordinator(Some(core_node(2)));

    assert!(
        cluster.run_until(2000, |c| c.cores_agree(&[2, 3], 2)),
        "survivors did not agree on a new membership"
    );
    assert_eq!(cluster.coordinator().node, core_node(2));

    let membership = cluster.core(3).stack.group_manager().membership().unwrap();
    assert!(membership.group().is_primary());
    assert_eq!(membership.id(), 2);
}

#[test]
fn test_member_failure_is_removed() {
    let mut cluster = TestCluster::formed(3);

    cluster.kill_core(3);
    assert!(cluster.run_until(2000, |c| c.cores_agree(&[1, 2], 2)));

    let coordinator = cluster.coordinator();
    assert_eq!(coordinator.node, core_node(1));
    assert!(coordinator.stack.core_protocol().pending_acks().is_empty());
}

#[test]
fn test_graceful_exit_of_core_node() {
    let mut cluster = TestCluster::formed(3);

    cluster.core_mut(3).stack.request_exit().unwrap();
    cluster.failure_detector.leave(&core_node(3));

    assert!(cluster.group_membership_id(3).is_none());
    assert!(cluster.cluster_membership(3).is_none());

    assert!(cluster.run_until(2000, |c| c.cores_agree(&[1, 2], 2)));
    assert!(cluster.group_membership_id(3).is_none());
}

#[test]
fn test_stale_delta_is_acknowledged_without_effect() {
    let mut cluster = TestCluster::formed(3);
    let first = cluster
        .core(1)
        .stack
        .cluster_manager()
        .last_delta()
        .unwrap();
    assert_eq!(first.id, 1);

    cluster.add_core(4);
    assert!(cluster.run_until(2000, |c| c.cores_agree(&[1, 2, 3, 4], 2)));
    let before = cluster.cluster_membership(2).unwrap();

    let now = cluster.now_ms;
    let replay = Message::new(
        core_node(1).address().clone(),
        Destination::Node(core_node(2).address().clone()),
        MessagePart::ClusterMembership(ClusterMembershipMessagePart {
            round_id: 4242,
            delta: (*first).clone(),
        }),
    );
    cluster.core_mut(2).stack.receive(replay, now).unwrap();

    let after = cluster.cluster_membership(2).unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    let acks: Vec<Message> = cluster
        .network
        .drain()
        .into_iter()
        .map(|(_, message)| message)
        .filter(|message| {
            matches!(
                message.top_part(),
                Some(MessagePart::ClusterMembershipResponse(ClusterMembershipResponseMessagePart {
                    round_id: 4242
                }))
            )
        })
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].destination, Destination::Node(core_node(1).address().clone()));
}

struct FailingListener;

impl ClusterMembershipListener for FailingListener {
    fn on_membership_changed(&self, _change: &ClusterMembershipChange) -> ListenerResult {
        Err(ListenerError::Failed("boom".to_string()))
    }
}

#[derive(Default)]
struct CountingListener {
    changes: AtomicUsize,
}

impl ClusterMembershipListener for CountingListener {
    fn on_membership_changed(&self, _change: &ClusterMembershipChange) -> ListenerResult {
        self.changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
#[traced_test]
fn test_failing_listener_does_not_block_others() {
    let mut cluster = TestCluster::formed(3);
    let counting = Arc::new(CountingListener::default());
    let manager = cluster.core(2).stack.cluster_manager().clone();
    manager.add_listener(Arc::new(FailingListener));
    manager.add_listener(counting.clone());

    cluster.add_core(4);
    assert!(cluster.run_until(2000, |c| c.cores_agree(&[1, 2, 3, 4], 2)));

    assert_eq!(counting.changes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.membership().map(|m| m.id()), Some(2));
}

#[test]
fn test_unacknowledged_round_holds_back_next_delta() {
    let mut cluster = TestCluster::formed(3);
    let silent = core_node(3);
    cluster.network.isolate(silent.address());

    cluster.add_worker(10, "compute");
    assert!(cluster.run_until(2000, |c| {
        c.cluster_membership(1).map(|m| m.id()) == Some(2)
    }));
    let round = cluster.core(1).stack.core_protocol().outstanding_round();
    assert!(round.is_some());
    assert_eq!(
        cluster.core(1).stack.core_protocol().pending_acks(),
        BTreeSet::from([silent.address().clone()])
    );

    cluster.add_worker(11, "compute");
    cluster.run_for(300);
    assert_eq!(cluster.core(1).stack.core_protocol().outstanding_round(), round);
    assert_eq!(cluster.cluster_membership(1).map(|m| m.id()), Some(2));
    assert!(cluster.worker_membership(11).is_none());

    // the silent member is now reported failed; one coordinator tick
    // abandons the round and reasserts the installed delta
    cluster.kill_core(3);
    cluster.now_ms += STEP_MS;
    let now = cluster.now_ms;
    cluster.core_mut(1).stack.on_timer(now).unwrap();

    let reassert_round = cluster.core(1).stack.core_protocol().outstanding_round();
    assert!(reassert_round > round);
    assert_eq!(cluster.cluster_membership(1).map(|m| m.id()), Some(2));

    let deliveries = cluster.network.drain();
    let reasserted: Vec<&ClusterMembershipMessagePart> = deliveries
        .iter()
        .filter(|(recipient, _)| recipient == core_node(2).address())
        .filter_map(|(_, message)| match message.top_part() {
            Some(MessagePart::ClusterMembership(part)) => Some(part),
            _ => None,
        })
        .collect();
    assert_eq!(reasserted.len(), 1);
    assert_eq!(Some(reasserted[0].round_id), reassert_round);
    assert_eq!(reasserted[0].delta.id, 2);
    assert!(!reasserted[0].delta.full);
    cluster.deliver(deliveries);

    assert!(cluster.run_until(2000, |c| {
        c.cores_agree(&[1, 2], 3) && c.worker_membership(11).is_some()
    }));
}

#[test]
fn test_unreachable_peer_no_longer_blocks_formation() {
    let mut cluster = TestCluster::new(2);
    let lowest = core_node(1);

    cluster.step();
    assert!(cluster.core(2).stack.discovery().known_peers().contains(&lowest));
    cluster.kill_core(1);

    cluster.run_for(300);
    assert!(cluster.group_membership_id(2).is_none());
    assert_eq!(cluster.core(2).stack.discovery().state(), DiscoveryState::Discovered);

    cluster.cleanup_policy.mark_unreachable(&lowest);
    assert!(cluster.run_until(1000, |c| c.group_membership_id(2) == Some(1)));

    let membership = cluster.core(2).stack.group_manager().membership().unwrap();
    assert_eq!(membership.group().members(), [core_node(2)]);
    assert!(cluster.core(2).stack.discovery().known_peers().is_empty());
}
