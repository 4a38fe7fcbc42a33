//! Assembly of the core and worker protocol stacks
//!
//! A stack wires the protocols of one node together and drives them from a
//! single compartment: [`ProtocolStack::on_timer`] and
//! [`ProtocolStack::receive`] are never called concurrently.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cluster::{
    ClusterMembershipManager, ClusterMembershipProvider, ClusterMembershipReceiver,
    CoreClusterMembershipProtocol, DefaultGroupMappingStrategy, GroupDefinition,
    GroupMappingStrategy, GroupsMembershipProvider, NodeMembershipProvider,
    WorkerClusterMembershipProtocol, WorkerToCoreMembershipProvider,
};
use crate::collaborators::{
    DiscoveryCleanupPolicy, FailureDetector, FlushCondition, FlushCoordinator, LiveNodeProvider,
    MessageSender, StateTransferStore,
};
use crate::config::MembershipConfig;
use crate::discovery::{ClusterNodeDiscovery, CoreDiscovery, EntryPointConnector, WorkerDiscovery};
use crate::error::{MembershipError, MembershipResult};
use crate::group::{GroupMembershipManager, GroupMembershipTracker, LeaveReason};
use crate::message::{Message, MessagePart};
use crate::node::Node;
use crate::routing::{GroupRouter, GroupSubstackFactory, RouteOutcome};

/// Protocol stack driven by a [`MembershipService`](crate::MembershipService)
pub trait ProtocolStack: Send + 'static {
    /// Local node
    fn local_node(&self) -> &Node;

    /// Periodic tick
    fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()>;

    /// Handle an inbound message
    fn receive(&mut self, message: Message, now_ms: u64) -> MembershipResult<()>;

    /// Stop every protocol; later calls are no-ops
    fn stop(&mut self);
}

fn log_failure(component: &str, result: MembershipResult<()>) {
    if let Err(err) = result {
        error!("{} failed: {}", component, err);
    }
}

fn missing(key: &str) -> MembershipError {
    MembershipError::Configuration(format!("missing {key}"))
}

/// Builder for [`CoreStack`]
pub struct CoreStackBuilder {
    config: MembershipConfig,
    local_node: Option<Node>,
    sender: Option<Arc<dyn MessageSender>>,
    failure_detector: Option<Arc<dyn FailureDetector>>,
    worker_failure_detector: Option<Arc<dyn FailureDetector>>,
    flush: Option<Arc<dyn FlushCoordinator>>,
    flush_condition: Option<Arc<dyn FlushCondition>>,
    live_nodes: Option<Arc<dyn LiveNodeProvider>>,
    store: Option<Arc<dyn StateTransferStore>>,
    cleanup_policy: Option<Arc<dyn DiscoveryCleanupPolicy>>,
    mapping_strategy: Option<Arc<dyn GroupMappingStrategy>>,
    group_manager: Option<Arc<GroupMembershipManager>>,
}

impl Default for CoreStackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreStackBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: MembershipConfig::default(),
            local_node: None,
            sender: None,
            failure_detector: None,
            worker_failure_detector: None,
            flush: None,
            flush_condition: None,
            live_nodes: None,
            store: None,
            cleanup_policy: None,
            mapping_strategy: None,
            group_manager: None,
        }
    }

    // Configuration

    /// Set the configuration
    pub fn config(mut self, config: MembershipConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local core node
    pub fn local_node(mut self, local_node: Node) -> Self {
        self.local_node = Some(local_node);
        self
    }

    // Collaborators

    /// Set the outbound message sender
    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the failure detector of the core group
    pub fn failure_detector(mut self, failure_detector: Arc<dyn FailureDetector>) -> Self {
        self.failure_detector = Some(failure_detector);
        self
    }

    /// Set the failure detector watching worker nodes
    pub fn worker_failure_detector(mut self, failure_detector: Arc<dyn FailureDetector>) -> Self {
        self.worker_failure_detector = Some(failure_detector);
        self
    }

    /// Set the flush coordinator of the core group
    pub fn flush(mut self, flush: Arc<dyn FlushCoordinator>) -> Self {
        self.flush = Some(flush);
        self
    }

    /// Set a flush veto hook
    pub fn flush_condition(mut self, condition: Arc<dyn FlushCondition>) -> Self {
        self.flush_condition = Some(condition);
        self
    }

    /// Set the live node provider used to reach entry points
    pub fn live_nodes(mut self, live_nodes: Arc<dyn LiveNodeProvider>) -> Self {
        self.live_nodes = Some(live_nodes);
        self
    }

    /// Set the snapshot store
    pub fn state_transfer_store(mut self, store: Arc<dyn StateTransferStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the discovery cleanup policy
    pub fn cleanup_policy(mut self, policy: Arc<dyn DiscoveryCleanupPolicy>) -> Self {
        self.cleanup_policy = Some(policy);
        self
    }

    /// Replace the group mapping strategy
    pub fn mapping_strategy(mut self, strategy: Arc<dyn GroupMappingStrategy>) -> Self {
        self.mapping_strategy = Some(strategy);
        self
    }

    /// Use an existing group membership manager, for example one the flush
    /// coordinator already commits to
    pub fn group_manager(mut self, manager: Arc<GroupMembershipManager>) -> Self {
        self.group_manager = Some(manager);
        self
    }

    /// Build the stack
    pub fn build(self) -> MembershipResult<CoreStack> {
        self.config.validate()?;
        let config = self.config;

        let local_node = self.local_node.ok_or_else(|| missing("local_node"))?;
        if !local_node.is_core() {
            return Err(MembershipError::invalid_argument(format!(
                "core stack requires a core node, got {} in domain {}",
                local_node,
                local_node.domain()
            )));
        }
        let sender = self.sender.ok_or_else(|| missing("sender"))?;
        let failure_detector = self.failure_detector.ok_or_else(|| missing("failure_detector"))?;
        let flush = self.flush.ok_or_else(|| missing("flush"))?;
        let live_nodes = self.live_nodes.ok_or_else(|| missing("live_nodes"))?;
        let mapping_strategy = self.mapping_strategy.unwrap_or_else(|| {
            Arc::new(DefaultGroupMappingStrategy::new(config.cluster.eviction_policy))
        });

        let group_manager = match self.group_manager {
            Some(manager) => {
                if manager.local_node().id() != local_node.id() {
                    return Err(MembershipError::invalid_argument(
                        "group membership manager belongs to another node",
                    ));
                }
                manager
            }
            None => Arc::new(GroupMembershipManager::new(local_node.clone())),
        };

        let cluster_discovery = Arc::new(ClusterNodeDiscovery::new(
            group_manager.clone(),
            failure_detector.clone(),
            sender.clone(),
        ));
        let node_provider = Arc::new(NodeMembershipProvider::new(
            group_manager.clone(),
            cluster_discovery.clone(),
            self.worker_failure_detector,
        ));
        let groups_provider = Arc::new(GroupsMembershipProvider::new(mapping_strategy));
        let cluster_manager = Arc::new(ClusterMembershipManager::new(vec![
            node_provider.clone() as Arc<dyn ClusterMembershipProvider>,
            groups_provider.clone() as Arc<dyn ClusterMembershipProvider>,
            Arc::new(WorkerToCoreMembershipProvider::new(group_manager.clone()))
                as Arc<dyn ClusterMembershipProvider>,
        ])?);

        let connector = EntryPointConnector::new(
            &config.discovery.entry_points,
            live_nodes,
            config.discovery.connection_timeout_ms,
        );
        let discovery = CoreDiscovery::new(
            &config.discovery,
            group_manager.clone(),
            failure_detector.clone(),
            sender.clone(),
            connector,
            self.cleanup_policy,
        );
        let tracker = GroupMembershipTracker::new(
            group_manager.clone(),
            failure_detector.clone(),
            flush.clone(),
            self.flush_condition,
            config.tracker.track_period_ms,
        );
        let receiver = ClusterMembershipReceiver::new(
            cluster_manager.clone(),
            sender.clone(),
            self.store.clone(),
            local_node.address().clone(),
        );
        let core_protocol = CoreClusterMembershipProtocol::new(
            group_manager.clone(),
            cluster_manager.clone(),
            failure_detector.clone(),
            flush,
            sender.clone(),
            self.store,
            config.cluster.dissemination_period_ms,
        );
        let worker_protocol = WorkerClusterMembershipProtocol::new(
            group_manager.clone(),
            cluster_manager.clone(),
            failure_detector,
            sender,
            config.cluster.dissemination_period_ms,
        );

        info!("Built core membership stack for {}", local_node);
        Ok(CoreStack {
            local_node,
            group_manager,
            cluster_manager,
            cluster_discovery,
            node_provider,
            groups_provider,
            discovery,
            tracker,
            receiver,
            core_protocol,
            worker_protocol,
            had_membership: false,
            stopped: false,
        })
    }
}

/// Membership stack of a core node
pub struct CoreStack {
    local_node: Node,
    group_manager: Arc<GroupMembershipManager>,
    cluster_manager: Arc<ClusterMembershipManager>,
    cluster_discovery: Arc<ClusterNodeDiscovery>,
    node_provider: Arc<NodeMembershipProvider>,
    groups_provider: Arc<GroupsMembershipProvider>,
    discovery: CoreDiscovery,
    tracker: GroupMembershipTracker,
    receiver: ClusterMembershipReceiver,
    core_protocol: CoreClusterMembershipProtocol,
    worker_protocol: WorkerClusterMembershipProtocol,
    had_membership: bool,
    stopped: bool,
}

impl CoreStack {
    /// Start building a core stack
    pub fn builder() -> CoreStackBuilder {
        CoreStackBuilder::new()
    }

    /// Core group membership manager
    pub fn group_manager(&self) -> &Arc<GroupMembershipManager> {
        &self.group_manager
    }

    /// Cluster membership manager
    pub fn cluster_manager(&self) -> &Arc<ClusterMembershipManager> {
        &self.cluster_manager
    }

    /// Core discovery
    pub fn discovery(&self) -> &CoreDiscovery {
        &self.discovery
    }

    /// Group membership tracker
    pub fn tracker(&self) -> &GroupMembershipTracker {
        &self.tracker
    }

    /// Core dissemination protocol
    pub fn core_protocol(&self) -> &CoreClusterMembershipProtocol {
        &self.core_protocol
    }

    /// Worker dissemination protocol
    pub fn worker_protocol(&self) -> &WorkerClusterMembershipProtocol {
        &self.worker_protocol
    }

    /// Queue a group definition for the next round
    pub fn add_group_definition(&self, definition: GroupDefinition) -> MembershipResult<()> {
        self.groups_provider.add_group_definition(definition)
    }

    /// Queue removal of a group definition
    pub fn remove_group_definition(&self, domain: &str, id: Uuid) {
        self.groups_provider.remove_group_definition(domain, id);
    }

    /// Remove a worker from the cluster in the next round
    pub fn request_worker_exit(&self, worker: Node) -> MembershipResult<()> {
        if worker.is_core() {
            return Err(MembershipError::invalid_argument(format!(
                "{worker} is a core node"
            )));
        }
        self.node_provider.request_exit(worker);
        Ok(())
    }

    /// Leave the core group gracefully and stop
    pub fn request_exit(&mut self) -> MembershipResult<()> {
        info!("Core node {} leaving", self.local_node);
        self.tracker.request_exit();
        self.stop();
        self.group_manager.uninstall(LeaveReason::Graceful)?;
        self.cluster_manager.uninstall()
    }

    fn detect_membership_loss(&mut self, now_ms: u64) -> MembershipResult<()> {
        let has_membership = self.group_manager.membership().is_some();
        let lost = self.had_membership && !has_membership;
        self.had_membership = has_membership;
        if lost {
            self.discovery.on_coordinator_lost(now_ms);
            self.cluster_manager.uninstall()?;
        }
        Ok(())
    }
}

impl ProtocolStack for CoreStack {
    fn local_node(&self) -> &Node {
        &self.local_node
    }

    fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        if self.stopped {
            return Ok(());
        }

        log_failure("core discovery", self.discovery.on_timer(now_ms));
        log_failure(
            "group membership tracker",
            self.tracker.on_timer(now_ms, &mut self.discovery).map(|_| ()),
        );
        log_failure("core dissemination", self.core_protocol.on_timer(now_ms));
        log_failure("worker dissemination", self.worker_protocol.on_timer(now_ms));

        self.detect_membership_loss(now_ms)
    }

    fn receive(&mut self, message: Message, _now_ms: u64) -> MembershipResult<()> {
        if self.stopped {
            return Ok(());
        }

        match message.top_part() {
            Some(MessagePart::Discovery(part)) => {
                let part = part.clone();
                self.discovery.receive_discovery(&message, &part)
            }
            Some(MessagePart::MembershipResponse(part)) => {
                self.discovery.receive_response(part);
                Ok(())
            }
            Some(MessagePart::GroupJoin(part)) => self.cluster_discovery.receive(&message, part),
            Some(MessagePart::ClusterMembership(_)) if message.source == *self.local_node.address() => Ok(()),
            Some(MessagePart::ClusterMembership(part)) => {
                self.receiver.receive(&message, part).map(|_| ())
            }
            Some(MessagePart::ClusterMembershipResponse(part)) => {
                let part = *part;
                if !self.core_protocol.on_response(&message, &part)
                    && !self.worker_protocol.on_response(&message, &part)
                {
                    debug!("Unmatched acknowledgement of round {} from {}", part.round_id, message.source);
                }
                Ok(())
            }
            other => {
                debug!(
                    "Core node {} ignoring {:?} from {}",
                    self.local_node,
                    other.map(MessagePart::kind),
                    message.source
                );
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.core_protocol.stop();
        self.worker_protocol.stop();
    }
}

/// Builder for [`WorkerStack`]
pub struct WorkerStackBuilder {
    config: MembershipConfig,
    local_node: Option<Node>,
    sender: Option<Arc<dyn MessageSender>>,
    live_nodes: Option<Arc<dyn LiveNodeProvider>>,
    substack_factory: Option<Arc<dyn GroupSubstackFactory>>,
}

impl Default for WorkerStackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStackBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: MembershipConfig::default(),
            local_node: None,
            sender: None,
            live_nodes: None,
            substack_factory: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: MembershipConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local worker node
    pub fn local_node(mut self, local_node: Node) -> Self {
        self.local_node = Some(local_node);
        self
    }

    /// Set the outbound message sender
    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the live node provider used to reach entry points
    pub fn live_nodes(mut self, live_nodes: Arc<dyn LiveNodeProvider>) -> Self {
        self.live_nodes = Some(live_nodes);
        self
    }

    /// Set the factory of per-group substacks
    pub fn substack_factory(mut self, factory: Arc<dyn GroupSubstackFactory>) -> Self {
        self.substack_factory = Some(factory);
        self
    }

    /// Build the stack
    pub fn build(self) -> MembershipResult<WorkerStack> {
        self.config.validate()?;
        let config = self.config;

        let local_node = self.local_node.ok_or_else(|| missing("local_node"))?;
        if local_node.is_core() {
            return Err(MembershipError::invalid_argument(format!(
                "worker stack requires a worker node, got core node {local_node}"
            )));
        }
        if config.discovery.entry_points.is_empty() {
            return Err(MembershipError::Configuration(
                "worker nodes need at least one entry point".to_string(),
            ));
        }
        let sender = self.sender.ok_or_else(|| missing("sender"))?;
        let live_nodes = self.live_nodes.ok_or_else(|| missing("live_nodes"))?;
        let substack_factory = self
            .substack_factory
            .ok_or_else(|| missing("substack_factory"))?;

        // workers only rebuild what the coordinator sends
        let cluster_manager = Arc::new(ClusterMembershipManager::new(vec![
            Arc::new(NodeMembershipProvider::passive()) as Arc<dyn ClusterMembershipProvider>,
            Arc::new(GroupsMembershipProvider::new(Arc::new(
                DefaultGroupMappingStrategy::new(config.cluster.eviction_policy),
            ))) as Arc<dyn ClusterMembershipProvider>,
            Arc::new(WorkerToCoreMembershipProvider::passive())
                as Arc<dyn ClusterMembershipProvider>,
        ])?);

        let connector = EntryPointConnector::new(
            &config.discovery.entry_points,
            live_nodes,
            config.discovery.connection_timeout_ms,
        );
        let discovery = WorkerDiscovery::new(
            &config.discovery,
            local_node.clone(),
            cluster_manager.clone(),
            sender.clone(),
            connector,
        );
        let receiver = ClusterMembershipReceiver::new(
            cluster_manager.clone(),
            sender.clone(),
            None,
            local_node.address().clone(),
        );
        let router = GroupRouter::new(
            local_node.clone(),
            cluster_manager.clone(),
            substack_factory,
            sender,
            config.router.removal_delay_ms,
        );

        info!("Built worker membership stack for {}", local_node);
        Ok(WorkerStack {
            local_node,
            cluster_manager,
            discovery,
            receiver,
            router,
            was_member: false,
            stopped: false,
        })
    }
}

/// Membership stack of a worker node
pub struct WorkerStack {
    local_node: Node,
    cluster_manager: Arc<ClusterMembershipManager>,
    discovery: WorkerDiscovery,
    receiver: ClusterMembershipReceiver,
    router: GroupRouter,
    was_member: bool,
    stopped: bool,
}

impl WorkerStack {
    /// Start building a worker stack
    pub fn builder() -> WorkerStackBuilder {
        WorkerStackBuilder::new()
    }

    /// Cluster membership as last received
    pub fn cluster_manager(&self) -> &Arc<ClusterMembershipManager> {
        &self.cluster_manager
    }

    /// Worker discovery
    pub fn discovery(&self) -> &WorkerDiscovery {
        &self.discovery
    }

    /// Group router
    pub fn router(&self) -> &GroupRouter {
        &self.router
    }

    /// Send a message to every member of one of the local node's groups
    pub fn send_to_group(&self, group_id: Uuid, message: Message) -> MembershipResult<()> {
        self.router.send(group_id, message)
    }
}

impl ProtocolStack for WorkerStack {
    fn local_node(&self) -> &Node {
        &self.local_node
    }

    fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        if self.stopped {
            return Ok(());
        }

        let is_member = self
            .cluster_manager
            .membership()
            .is_some_and(|membership| membership.contains_node(&self.local_node));
        if self.was_member && !is_member {
            info!("Worker {} was dropped from the cluster", self.local_node);
            self.discovery.restart();
        }
        self.was_member = is_member;

        log_failure("worker discovery", self.discovery.on_timer(now_ms));
        log_failure("group router", self.router.on_timer(now_ms));
        Ok(())
    }

    fn receive(&mut self, message: Message, _now_ms: u64) -> MembershipResult<()> {
        if self.stopped {
            return Ok(());
        }

        if matches!(message.top_part(), Some(MessagePart::Group(_))) {
            if let RouteOutcome::Unhandled(message) = self.router.receive(message)? {
                debug!(
                    "Worker {} dropped group message from {}",
                    self.local_node, message.source
                );
            }
            return Ok(());
        }

        match message.top_part() {
            Some(MessagePart::ClusterMembership(part)) => {
                self.receiver.receive(&message, part).map(|_| ())
            }
            other => {
                debug!(
                    "Worker {} ignoring {:?} from {}",
                    self.local_node,
                    other.map(MessagePart::kind),
                    message.source
                );
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.router.stop();
    }
}
