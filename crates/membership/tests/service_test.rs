//! Stacks driven by the async membership service

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{core_node, init_test_logging, test_config};
use proven_membership::group::CORE_GROUP_ID;
use proven_membership::{
    ClusterMembershipManager, CoreStack, GroupMembershipManager, MembershipError, MembershipResult,
    MembershipService, Message, Node, ProtocolStack, SystemClock,
};
use proven_membership_mock::{
    ImmediateFlushCoordinator, MemoryNetwork, MockFailureDetector, MockLiveNodeProvider,
};

struct ServiceNode {
    group_manager: Arc<GroupMembershipManager>,
    cluster_manager: Arc<ClusterMembershipManager>,
    service: MembershipService<CoreStack>,
}

fn start_node(
    id: u128,
    entry_points: &[u128],
    network: &Arc<MemoryNetwork>,
    flush: &Arc<ImmediateFlushCoordinator>,
) -> ServiceNode {
    let node = core_node(id);
    let group_manager = Arc::new(GroupMembershipManager::new(node.clone()));
    flush.register(group_manager.clone());

    let entry_points: Vec<_> = entry_points.iter().map(|id| core_node(*id)).collect();
    let mut config = test_config(&entry_points);
    config.discovery.group_formation_period_ms = 200;

    let stack = CoreStack::builder()
        .config(config)
        .local_node(node.clone())
        .sender(network.sender(node.address().clone()))
        .failure_detector(Arc::new(MockFailureDetector::new()))
        .flush(flush.clone())
        .live_nodes(Arc::new(MockLiveNodeProvider::new()))
        .group_manager(group_manager.clone())
        .build()
        .unwrap();
    let cluster_manager = stack.cluster_manager().clone();

    let service = MembershipService::new(
        stack,
        Arc::new(SystemClock::new()),
        Duration::from_millis(10),
    );
    network.connect(node.address().clone(), service.inbound_sender());

    ServiceNode {
        group_manager,
        cluster_manager,
        service,
    }
}

async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_single_node_service_forms_group() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let flush = Arc::new(ImmediateFlushCoordinator::new());
    let node = start_node(1, &[], &network, &flush);

    node.service.start().await.unwrap();
    assert!(node.service.is_running().await);
    assert!(node.service.start().await.is_err());

    let cluster_manager = node.cluster_manager.clone();
    assert!(wait_for(|| cluster_manager.membership().is_some()).await);
    assert_eq!(node.group_manager.membership().map(|m| m.id()), Some(1));
    assert_eq!(node.cluster_manager.membership().map(|m| m.id()), Some(1));

    node.service.shutdown().await.unwrap();
    assert!(!node.service.is_running().await);
    assert!(node.service.take_stack().await.is_some());
    assert!(node.service.take_stack().await.is_none());
}

#[tokio::test]
async fn test_two_services_agree_over_network() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let flush = Arc::new(ImmediateFlushCoordinator::new());
    let first = start_node(1, &[1, 2], &network, &flush);
    let second = start_node(2, &[1, 2], &network, &flush);

    let pump_network = network.clone();
    let pump_manager = first.group_manager.clone();
    let pump = tokio::spawn(async move {
        loop {
            if let Some(membership) = pump_manager.membership() {
                let members = membership
                    .group()
                    .members()
                    .iter()
                    .map(|node| node.address().clone())
                    .collect();
                pump_network.set_group(CORE_GROUP_ID, members);
            }
            pump_network.deliver_all();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    first.service.start().await.unwrap();
    second.service.start().await.unwrap();

    let managers = [first.cluster_manager.clone(), second.cluster_manager.clone()];
    let agreed = wait_for(|| {
        managers.iter().all(|manager| {
            manager.membership().is_some_and(|membership| {
                membership
                    .core_domain()
                    .and_then(|domain| domain.nodes())
                    .is_some_and(|nodes| nodes.nodes.len() == 2)
            })
        })
    })
    .await;
    assert!(agreed, "services did not agree on a two-node membership");

    let group = second.group_manager.membership().unwrap();
    assert_eq!(group.group().coordinator(), &core_node(1));

    first.service.shutdown().await.unwrap();
    second.service.shutdown().await.unwrap();
    pump.abort();
}

#[tokio::test]
async fn test_shutdown_before_start_keeps_stack() {
    let network = MemoryNetwork::new();
    let flush = Arc::new(ImmediateFlushCoordinator::new());
    let node = start_node(1, &[], &network, &flush);

    node.service.shutdown().await.unwrap();
    assert!(!node.service.is_running().await);
    assert!(node.service.start().await.is_err());
    assert!(node.service.take_stack().await.is_some());
}

struct StuckStack {
    node: Node,
}

impl ProtocolStack for StuckStack {
    fn local_node(&self) -> &Node {
        &self.node
    }

    fn on_timer(&mut self, _now_ms: u64) -> MembershipResult<()> {
        Ok(())
    }

    fn receive(&mut self, _message: Message, _now_ms: u64) -> MembershipResult<()> {
        Ok(())
    }

    fn stop(&mut self) {
        std::thread::sleep(Duration::from_millis(500));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_aborts_task() {
    init_test_logging();
    let service = MembershipService::new(
        StuckStack { node: core_node(1) },
        Arc::new(SystemClock::new()),
        Duration::from_millis(10),
    )
    .with_shutdown_timeout(Duration::from_millis(50));

    service.start().await.unwrap();
    let result = service.shutdown().await;

    assert!(matches!(result, Err(MembershipError::Service(_))));
    assert!(!service.is_running().await);
    assert!(service.take_stack().await.is_none());
}
