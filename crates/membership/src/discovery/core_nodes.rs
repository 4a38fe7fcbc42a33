//! Discovery of the core group and its coordinator

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::entry_points::EntryPointConnector;
use super::{DiscoveryState, NodeDiscovery};
use crate::clock::PeriodGate;
use crate::collaborators::{DiscoveryCleanupPolicy, FailureDetector, MessageSender};
use crate::config::DiscoveryConfig;
use crate::error::MembershipResult;
use crate::group::{GroupMembership, GroupMembershipManager};
use crate::message::{
    Destination, DiscoveryMessagePart, MembershipResponseMessagePart, Message, MessagePart,
};
use crate::node::{Address, Node, NodeId};

/// Finds core peers and the core coordinator
pub struct CoreDiscovery {
    local_node: Node,
    manager: Arc<GroupMembershipManager>,
    failure_detector: Arc<dyn FailureDetector>,
    sender: Arc<dyn MessageSender>,
    cleanup_policy: Option<Arc<dyn DiscoveryCleanupPolicy>>,
    connector: EntryPointConnector,
    discovery_gate: PeriodGate,
    cleanup_gate: PeriodGate,
    group_formation_period_ms: u64,
    started_at: Option<u64>,
    known_peers: BTreeSet<Node>,
    discovered: BTreeSet<Node>,
    coordinator: Option<Address>,
}

impl CoreDiscovery {
    /// Create core discovery for the local node
    pub fn new(
        config: &DiscoveryConfig,
        manager: Arc<GroupMembershipManager>,
        failure_detector: Arc<dyn FailureDetector>,
        sender: Arc<dyn MessageSender>,
        connector: EntryPointConnector,
        cleanup_policy: Option<Arc<dyn DiscoveryCleanupPolicy>>,
    ) -> Self {
        Self {
            local_node: manager.local_node().clone(),
            manager,
            failure_detector,
            sender,
            cleanup_policy,
            connector,
            discovery_gate: PeriodGate::new(config.discovery_period_ms),
            cleanup_gate: PeriodGate::new(config.cleanup_period_ms),
            group_formation_period_ms: config.group_formation_period_ms,
            started_at: None,
            known_peers: BTreeSet::new(),
            discovered: BTreeSet::new(),
            coordinator: None,
        }
    }

    /// Discovery progress of the local node
    pub fn state(&self) -> DiscoveryState {
        if self.manager.membership().is_some() {
            DiscoveryState::Joined
        } else if self.coordinator.is_some() {
            DiscoveryState::CoordinatorKnown
        } else if self.known_peers.is_empty() {
            DiscoveryState::Undiscovered
        } else {
            DiscoveryState::Discovered
        }
    }

    /// Peers heard of since discovery (re)started
    pub fn known_peers(&self) -> &BTreeSet<Node> {
        &self.known_peers
    }

    /// Address of the coordinator that answered, if any
    pub fn coordinator(&self) -> Option<&Address> {
        self.coordinator.as_ref()
    }

    /// One discovery tick
    pub fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        let started_at = *self.started_at.get_or_insert(now_ms);

        if self.cleanup_gate.try_pass(now_ms) && now_ms > started_at {
            self.cleanup();
        }

        if self.manager.membership().is_some() || !self.discovery_gate.try_pass(now_ms) {
            return Ok(());
        }

        let mut targets: BTreeSet<Address> = self.connector.resolve_all(now_ms).into_iter().collect();
        targets.extend(self.known_peers.iter().map(|peer| peer.address().clone()));
        targets.extend(self.coordinator.iter().cloned());
        targets.remove(self.local_node.address());

        if targets.is_empty() {
            return Ok(());
        }

        let mut discovered_nodes = self.known_peers.clone();
        discovered_nodes.insert(self.local_node.clone());
        let part = DiscoveryMessagePart {
            discovered_nodes,
            core: true,
        };

        debug!(
            "Broadcasting discovery from {} to {} targets ({})",
            self.local_node,
            targets.len(),
            self.state()
        );
        for target in targets {
            self.sender.send(Message::new(
                self.local_node.address().clone(),
                Destination::Node(target),
                MessagePart::Discovery(part.clone()),
            ))?;
        }

        Ok(())
    }

    /// Handle a discovery message
    pub fn receive_discovery(
        &mut self,
        message: &Message,
        part: &DiscoveryMessagePart,
    ) -> MembershipResult<()> {
        if !part.core {
            debug!("Ignoring non-core discovery from {}", message.source);
            return Ok(());
        }

        let reported: BTreeSet<Node> = part
            .discovered_nodes
            .iter()
            .filter(|node| node.is_core() && node.id() != self.local_node.id())
            .cloned()
            .collect();
        self.known_peers.extend(reported.iter().cloned());

        let Some(membership) = self.manager.membership() else {
            self.discovered.extend(reported);
            return Ok(());
        };

        let group = membership.group();
        let sender_is_member = group
            .members()
            .iter()
            .any(|member| member.address() == &message.source);
        let coordinator = self.current_coordinator(&membership);

        if coordinator.id() == self.local_node.id() {
            let newcomers: Vec<Node> = reported
                .into_iter()
                .filter(|node| !group.contains(&node.id()))
                .collect();
            if !newcomers.is_empty() {
                info!(
                    "Coordinator {} discovered {} new core nodes via {}",
                    self.local_node,
                    newcomers.len(),
                    message.source
                );
                self.discovered.extend(newcomers);
            }

            if !sender_is_member {
                self.respond(&membership, &message.source)?;
            }
        } else if !sender_is_member {
            debug!(
                "Forwarding discovery from {} to coordinator {}",
                message.source, coordinator
            );
            self.sender
                .send(message.readdressed(Destination::Node(coordinator.address().clone())))?;
        }

        Ok(())
    }

    /// Handle a coordinator answer
    pub fn receive_response(&mut self, part: &MembershipResponseMessagePart) {
        if self.manager.membership().is_some() {
            return;
        }

        if let Some(coordinator) = part.coordinator() {
            if self.coordinator.as_ref() != Some(coordinator) {
                info!(
                    "{} learned coordinator {} of membership {}",
                    self.local_node, coordinator, part.membership_id
                );
            }
            self.coordinator = Some(coordinator.clone());
        }
    }

    /// Forget everything and start over after the coordinator was lost
    pub fn on_coordinator_lost(&mut self, now_ms: u64) {
        warn!("{} lost its coordinator, restarting discovery", self.local_node);
        self.known_peers.clear();
        self.discovered.clear();
        self.coordinator = None;
        self.started_at = Some(now_ms);
        self.discovery_gate.reset();
    }

    /// Purge peers and coordinators declared unreachable
    pub fn cleanup(&mut self) {
        let Some(policy) = &self.cleanup_policy else {
            return;
        };

        let before = self.known_peers.len() + self.discovered.len();
        self.known_peers.retain(|node| !policy.is_unreachable(node));
        self.discovered.retain(|node| !policy.is_unreachable(node));
        let purged = before - self.known_peers.len() - self.discovered.len();
        if purged > 0 {
            debug!("Purged {} unreachable discovered nodes", purged);
        }

        if self
            .coordinator
            .as_ref()
            .is_some_and(|address| policy.is_coordinator_unreachable(address))
        {
            info!("Forgetting unreachable coordinator");
            self.coordinator = None;
        }
    }

    fn current_coordinator(&self, membership: &GroupMembership) -> Node {
        self.failure_detector
            .current_coordinator()
            .unwrap_or_else(|| membership.group().coordinator().clone())
    }

    fn respond(&self, membership: &GroupMembership, target: &Address) -> MembershipResult<()> {
        let failed: BTreeSet<NodeId> = self
            .failure_detector
            .failed_members()
            .iter()
            .chain(self.failure_detector.left_members().iter())
            .map(Node::id)
            .collect();

        let mut healthy_members = vec![self.local_node.address().clone()];
        healthy_members.extend(
            membership
                .group()
                .members()
                .iter()
                .filter(|m| m.id() != self.local_node.id() && !failed.contains(&m.id()))
                .map(|m| m.address().clone()),
        );

        let response = MembershipResponseMessagePart::new(membership.id(), healthy_members)?;
        self.sender.send(Message::new(
            self.local_node.address().clone(),
            Destination::Node(target.clone()),
            MessagePart::MembershipResponse(response),
        ))
    }
}

impl NodeDiscovery for CoreDiscovery {
    fn can_form_group(&self, now_ms: u64) -> bool {
        if self.manager.membership().is_some() || self.coordinator.is_some() {
            return false;
        }

        let Some(started_at) = self.started_at else {
            return false;
        };
        if now_ms.saturating_sub(started_at) < self.group_formation_period_ms {
            return false;
        }

        self.known_peers
            .iter()
            .map(Node::id)
            .min()
            .is_none_or(|lowest| self.local_node.id() <= lowest)
    }

    fn take_discovered_nodes(&mut self) -> BTreeSet<Node> {
        std::mem::take(&mut self.discovered)
    }
}
