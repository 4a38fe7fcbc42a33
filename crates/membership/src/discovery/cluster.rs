//! Core-side admission of worker nodes

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::collaborators::{FailureDetector, MessageSender};
use crate::error::MembershipResult;
use crate::group::GroupMembershipManager;
use crate::message::{Destination, GroupJoinMessagePart, Message};
use crate::node::Node;

/// Collects join requests of worker nodes on the core coordinator.
///
/// Shared between the stack (which feeds it messages) and the node
/// membership provider (which drains it once per round).
pub struct ClusterNodeDiscovery {
    manager: Arc<GroupMembershipManager>,
    failure_detector: Arc<dyn FailureDetector>,
    sender: Arc<dyn MessageSender>,
    joining: Mutex<BTreeMap<String, BTreeSet<Node>>>,
}

impl ClusterNodeDiscovery {
    /// Create worker admission for the core group held by `manager`
    pub fn new(
        manager: Arc<GroupMembershipManager>,
        failure_detector: Arc<dyn FailureDetector>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            manager,
            failure_detector,
            sender,
            joining: Mutex::new(BTreeMap::new()),
        }
    }

    /// Handle a join request
    pub fn receive(&self, message: &Message, part: &GroupJoinMessagePart) -> MembershipResult<()> {
        let joining = &part.joining_node;
        if joining.is_core() {
            debug!("Ignoring join request of core node {}", joining);
            return Ok(());
        }

        let Some(membership) = self.manager.membership() else {
            debug!("Dropping join request of {}: core group not formed", joining);
            return Ok(());
        };

        let local_id = self.manager.local_node().id();
        let coordinator = self
            .failure_detector
            .current_coordinator()
            .unwrap_or_else(|| membership.group().coordinator().clone());

        if coordinator.id() == local_id {
            let mut pending = self.joining.lock();
            let added = pending
                .entry(joining.domain().to_string())
                .or_default()
                .insert(joining.clone());
            if added {
                info!("Worker {} asked to join domain {}", joining, joining.domain());
            }
        } else if &message.source == joining.address() {
            // forwarded at most once: the forwarded copy no longer comes from the joining node
            let mut forwarded = message.readdressed(Destination::Node(coordinator.address().clone()));
            forwarded.source = self.manager.local_node().address().clone();
            debug!("Forwarding join request of {} to {}", joining, coordinator);
            self.sender.send(forwarded)?;
        }

        Ok(())
    }

    /// Domains with pending join requests
    pub fn pending_domains(&self) -> BTreeSet<String> {
        self.joining.lock().keys().cloned().collect()
    }

    /// Hand off and clear the pending join requests, per domain
    pub fn take_joining_nodes(&self) -> BTreeMap<String, BTreeSet<Node>> {
        std::mem::take(&mut *self.joining.lock())
    }
}
