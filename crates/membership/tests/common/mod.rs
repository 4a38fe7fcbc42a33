//! Test helpers driving whole clusters of membership stacks
//!
//! Every node runs on the same thread: a step ticks every live stack with
//! the shared clock and then delivers queued messages until the network is
//! quiet.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use proven_membership::group::CORE_GROUP_ID;
use proven_membership::{
    Address, CORE_DOMAIN, ClusterMembership, CoreStack, FailureDetector, GroupMembershipManager,
    MembershipConfig, Message, Node, NodeId, ProtocolStack, WorkerStack,
};
use proven_membership_mock::{
    ImmediateFlushCoordinator, MemoryNetwork, MemoryStateTransferStore, MockCleanupPolicy,
    MockFailureDetector, MockLiveNodeProvider, RecordingSubstackFactory,
};
use tracing::warn;

/// Simulated time per step
pub const STEP_MS: u64 = 10;

/// Grace delay of removed group substacks in test configurations
pub const REMOVAL_DELAY_MS: u64 = 100;

const MAX_DELIVERY_ROUNDS: usize = 64;

static INIT: Once = Once::new();

/// Install a test writer subscriber once per test binary
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Core node with a deterministic id
pub fn core_node(id: u128) -> Node {
    Node::new(
        NodeId::from_u128(id),
        format!("core-{id}"),
        format!("core-{id}:7000"),
        CORE_DOMAIN,
    )
}

/// Worker node with a deterministic id
pub fn worker_node(id: u128, domain: &str) -> Node {
    Node::new(
        NodeId::from_u128(id),
        format!("worker-{id}"),
        format!("worker-{id}:7100"),
        domain,
    )
}

/// Configuration with short periods, reaching the given entry points
pub fn test_config(entry_points: &[Node]) -> MembershipConfig {
    let mut config = MembershipConfig::default();
    config.discovery.discovery_period_ms = 10;
    config.discovery.group_formation_period_ms = 100;
    config.discovery.connection_timeout_ms = 50;
    config.discovery.cleanup_period_ms = 50;
    config.discovery.entry_points = entry_points
        .iter()
        .map(|node| node.address().to_string())
        .collect();
    config.tracker.track_period_ms = 10;
    config.cluster.dissemination_period_ms = 10;
    config.router.removal_delay_ms = REMOVAL_DELAY_MS;
    config.tick_interval_ms = 10;
    config
}

/// Core node of a [`TestCluster`]
pub struct CoreMember {
    pub node: Node,
    pub stack: CoreStack,
    pub alive: bool,
}

/// Worker node of a [`TestCluster`]
pub struct WorkerMember {
    pub node: Node,
    pub stack: WorkerStack,
    pub substacks: Arc<RecordingSubstackFactory>,
    pub alive: bool,
}

/// Cluster of core and worker stacks sharing an in-memory network
pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub failure_detector: Arc<MockFailureDetector>,
    pub worker_failure_detector: Arc<MockFailureDetector>,
    pub flush: Arc<ImmediateFlushCoordinator>,
    pub store: Arc<MemoryStateTransferStore>,
    pub live_nodes: Arc<MockLiveNodeProvider>,
    pub cleanup_policy: Arc<MockCleanupPolicy>,
    pub cores: Vec<CoreMember>,
    pub workers: Vec<WorkerMember>,
    pub now_ms: u64,
    entry_points: Vec<Node>,
}

impl TestCluster {
    /// Create a cluster of core nodes `1..=core_count`, each using all of
    /// them as entry points
    pub fn new(core_count: u128) -> Self {
        let entry_points: Vec<Node> = (1..=core_count).map(core_node).collect();
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            failure_detector: Arc::new(MockFailureDetector::new()),
            worker_failure_detector: Arc::new(MockFailureDetector::new()),
            flush: Arc::new(ImmediateFlushCoordinator::new()),
            store: Arc::new(MemoryStateTransferStore::new()),
            live_nodes: Arc::new(MockLiveNodeProvider::new()),
            cleanup_policy: Arc::new(MockCleanupPolicy::new()),
            cores: Vec::new(),
            workers: Vec::new(),
            now_ms: 0,
            entry_points,
        };
        for id in 1..=core_count {
            cluster.add_core(id);
        }
        cluster
    }

    /// Create a cluster and run it until the core group and the first
    /// cluster membership are installed everywhere
    pub fn formed(core_count: u128) -> Self {
        let mut cluster = Self::new(core_count);
        let ids: Vec<u128> = (1..=core_count).collect();
        assert!(
            cluster.run_until(3000, |c| c.cores_agree(&ids, 1)),
            "core group did not form"
        );
        cluster
    }

    /// Start a core node
    pub fn add_core(&mut self, id: u128) {
        let node = core_node(id);
        let manager = Arc::new(GroupMembershipManager::new(node.clone()));
        self.flush.register(manager.clone());

        let mut entry_points = self.entry_points.clone();
        if !entry_points.contains(&node) {
            entry_points.push(node.clone());
        }

        let stack = CoreStack::builder()
            .config(test_config(&entry_points))
            .local_node(node.clone())
            .sender(self.network.sender(node.address().clone()))
            .failure_detector(self.failure_detector.clone())
            .worker_failure_detector(self.worker_failure_detector.clone())
            .flush(self.flush.clone())
            .live_nodes(self.live_nodes.clone())
            .state_transfer_store(self.store.clone())
            .cleanup_policy(self.cleanup_policy.clone())
            .group_manager(manager)
            .build()
            .unwrap();

        self.cores.push(CoreMember {
            node,
            stack,
            alive: true,
        });
    }

    /// Start a worker node reaching the cluster through core node 1
    pub fn add_worker(&mut self, id: u128, domain: &str) {
        let node = worker_node(id, domain);
        let substacks = Arc::new(RecordingSubstackFactory::new());
        let stack = WorkerStack::builder()
            .config(test_config(&[core_node(1)]))
            .local_node(node.clone())
            .sender(self.network.sender(node.address().clone()))
            .live_nodes(self.live_nodes.clone())
            .substack_factory(substacks.clone())
            .build()
            .unwrap();

        self.workers.push(WorkerMember {
            node,
            stack,
            substacks,
            alive: true,
        });
    }

    pub fn core(&self, id: u128) -> &CoreMember {
        let node_id = NodeId::from_u128(id);
        self.cores
            .iter()
            .find(|core| core.node.id() == node_id)
            .unwrap()
    }

    pub fn core_mut(&mut self, id: u128) -> &mut CoreMember {
        let node_id = NodeId::from_u128(id);
        self.cores
            .iter_mut()
            .find(|core| core.node.id() == node_id)
            .unwrap()
    }

    pub fn worker(&self, id: u128) -> &WorkerMember {
        let node_id = NodeId::from_u128(id);
        self.workers
            .iter()
            .find(|worker| worker.node.id() == node_id)
            .unwrap()
    }

    /// Live core node currently coordinating the core group
    pub fn coordinator(&self) -> &CoreMember {
        let designated = self
            .cores
            .iter()
            .filter(|core| core.alive)
            .find_map(|core| {
                let membership = core.stack.group_manager().membership()?;
                Some(
                    self.failure_detector
                        .current_coordinator()
                        .map(|node| node.id())
                        .unwrap_or_else(|| membership.group().coordinator().id()),
                )
            })
            .unwrap();
        self.cores
            .iter()
            .find(|core| core.alive && core.node.id() == designated)
            .unwrap()
    }

    /// Group membership id installed on a core node
    pub fn group_membership_id(&self, id: u128) -> Option<u64> {
        self.core(id)
            .stack
            .group_manager()
            .membership()
            .map(|membership| membership.id())
    }

    /// Cluster membership installed on a core node
    pub fn cluster_membership(&self, id: u128) -> Option<Arc<ClusterMembership>> {
        self.core(id).stack.cluster_manager().membership()
    }

    /// Cluster membership installed on a worker node
    pub fn worker_membership(&self, id: u128) -> Option<Arc<ClusterMembership>> {
        self.worker(id).stack.cluster_manager().membership()
    }

    /// Core node ids listed in a cluster membership
    pub fn core_ids(membership: &ClusterMembership) -> Vec<NodeId> {
        membership
            .core_domain()
            .and_then(|domain| domain.nodes())
            .map(|nodes| nodes.nodes.iter().map(Node::id).collect())
            .unwrap_or_default()
    }

    /// Whether every listed core node installed the core group with exactly
    /// these members and a cluster membership of at least `cluster_id`
    pub fn cores_agree(&self, ids: &[u128], cluster_id: u64) -> bool {
        let expected: Vec<NodeId> = ids.iter().map(|id| NodeId::from_u128(*id)).collect();
        ids.iter().all(|id| {
            let core = self.core(*id);
            let group_members: Option<Vec<NodeId>> =
                core.stack.group_manager().membership().map(|membership| {
                    membership.group().members().iter().map(Node::id).collect()
                });
            let cluster = core.stack.cluster_manager().membership();
            group_members.as_ref() == Some(&expected)
                && cluster.as_deref().is_some_and(|cluster| {
                    cluster.id() >= cluster_id && Self::core_ids(cluster) == expected
                })
        })
    }

    /// Crash a core node: it stops running and the failure detector reports it
    pub fn kill_core(&mut self, id: u128) {
        let (node, manager) = {
            let core = self.core_mut(id);
            core.alive = false;
            (core.node.clone(), core.stack.group_manager().clone())
        };
        self.network.isolate(node.address());
        self.live_nodes.set_down(node.address().as_str());
        self.flush.unregister(&manager);
        self.failure_detector.fail(&node);
    }

    /// Crash a worker node
    pub fn kill_worker(&mut self, id: u128) {
        let node = self.worker(id).node.clone();
        if let Some(worker) = self.workers.iter_mut().find(|w| w.node == node) {
            worker.alive = false;
        }
        self.network.isolate(node.address());
        self.worker_failure_detector.fail(&node);
    }

    /// Advance the clock by one step, tick every live stack and deliver
    pub fn step(&mut self) {
        self.now_ms += STEP_MS;
        let now = self.now_ms;

        for core in self.cores.iter_mut().filter(|core| core.alive) {
            core.stack.on_timer(now).unwrap();
        }
        for worker in self.workers.iter_mut().filter(|worker| worker.alive) {
            worker.stack.on_timer(now).unwrap();
        }

        self.deliver_pending();
    }

    /// Run for the given simulated duration
    pub fn run_for(&mut self, duration_ms: u64) {
        let until = self.now_ms + duration_ms;
        while self.now_ms < until {
            self.step();
        }
    }

    /// Step until `condition` holds; returns false on timeout
    pub fn run_until(&mut self, timeout_ms: u64, condition: impl Fn(&Self) -> bool) -> bool {
        let until = self.now_ms + timeout_ms;
        while self.now_ms < until {
            self.step();
            if condition(self) {
                return true;
            }
        }
        false
    }

    /// Deliver queued messages until the network is quiet
    pub fn deliver_pending(&mut self) {
        for _ in 0..MAX_DELIVERY_ROUNDS {
            self.refresh_groups();
            let deliveries = self.network.drain();
            if deliveries.is_empty() {
                return;
            }
            self.deliver(deliveries);
        }
    }

    /// Hand drained messages to their live recipients
    pub fn deliver(&mut self, deliveries: Vec<(Address, Message)>) {
        let now = self.now_ms;
        for (recipient, message) in deliveries {
            let result = if let Some(core) = self
                .cores
                .iter_mut()
                .find(|core| core.alive && core.node.address() == &recipient)
            {
                core.stack.receive(message, now)
            } else if let Some(worker) = self
                .workers
                .iter_mut()
                .find(|worker| worker.alive && worker.node.address() == &recipient)
            {
                worker.stack.receive(message, now)
            } else {
                Ok(())
            };
            if let Err(err) = result {
                warn!("Delivery to {} failed: {}", recipient, err);
            }
        }
    }

    fn refresh_groups(&self) {
        let live = || self.cores.iter().filter(|core| core.alive);

        if let Some(membership) = live()
            .filter_map(|core| core.stack.group_manager().membership())
            .max_by_key(|membership| membership.id())
        {
            self.network
                .set_group(CORE_GROUP_ID, addresses(membership.group().members()));
        }

        if let Some(cluster) = live()
            .filter_map(|core| core.stack.cluster_manager().membership())
            .max_by_key(|membership| membership.id())
        {
            for domain in cluster.domains() {
                if let Some(groups) = domain.groups() {
                    for group in groups.groups.values() {
                        self.network.set_group(group.id(), addresses(group.members()));
                    }
                }
            }
        }
    }
}

fn addresses(nodes: &[Node]) -> Vec<Address> {
    nodes.iter().map(|node| node.address().clone()).collect()
}
