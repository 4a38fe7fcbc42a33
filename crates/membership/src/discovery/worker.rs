//! Worker-side discovery of the core group

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use super::entry_points::EntryPointConnector;
use crate::clock::PeriodGate;
use crate::cluster::ClusterMembershipManager;
use crate::collaborators::MessageSender;
use crate::config::DiscoveryConfig;
use crate::error::MembershipResult;
use crate::message::{Destination, GroupJoinMessagePart, Message, MessagePart};
use crate::node::Node;

/// Asks a randomly chosen entry point to admit the local worker until the
/// worker shows up in the installed cluster membership.
pub struct WorkerDiscovery {
    local_node: Node,
    cluster_manager: Arc<ClusterMembershipManager>,
    sender: Arc<dyn MessageSender>,
    connector: EntryPointConnector,
    gate: PeriodGate,
    entry_point: Option<String>,
    enabled: bool,
}

impl WorkerDiscovery {
    /// Create worker discovery for the local node
    pub fn new(
        config: &DiscoveryConfig,
        local_node: Node,
        cluster_manager: Arc<ClusterMembershipManager>,
        sender: Arc<dyn MessageSender>,
        connector: EntryPointConnector,
    ) -> Self {
        Self {
            local_node,
            cluster_manager,
            sender,
            connector,
            gate: PeriodGate::new(config.discovery_period_ms),
            entry_point: None,
            enabled: true,
        }
    }

    /// Whether the worker is still looking for the cluster
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Entry point currently targeted
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Resume discovery after the worker was dropped from the cluster
    pub fn restart(&mut self) {
        if !self.enabled {
            info!("Worker {} restarting discovery", self.local_node);
        }
        self.enabled = true;
        self.entry_point = None;
        self.gate.reset();
    }

    /// One discovery tick
    pub fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if self
            .cluster_manager
            .membership()
            .is_some_and(|membership| membership.contains_node(&self.local_node))
        {
            info!("Worker {} joined the cluster, discovery disabled", self.local_node);
            self.enabled = false;
            return Ok(());
        }

        if !self.gate.try_pass(now_ms) {
            return Ok(());
        }

        let retry = match &self.entry_point {
            None => true,
            Some(name) => self.connector.has_timed_out(name, now_ms),
        };
        if retry {
            self.entry_point = self
                .connector
                .entry_points()
                .choose(&mut rand::thread_rng())
                .cloned();
        }

        let Some(name) = self.entry_point.clone() else {
            return Ok(());
        };
        let Some(address) = self.connector.try_resolve(&name, now_ms) else {
            debug!("Entry point {} not live yet", name);
            return Ok(());
        };

        debug!("Worker {} requesting admission via {}", self.local_node, address);
        self.sender.send(Message::new(
            self.local_node.address().clone(),
            Destination::Node(address),
            MessagePart::GroupJoin(GroupJoinMessagePart {
                joining_node: self.local_node.clone(),
            }),
        ))
    }
}
