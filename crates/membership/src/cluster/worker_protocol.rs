//! Dissemination of the cluster membership from the core coordinator to
//! worker nodes

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, trace};

use super::manager::ClusterMembershipManager;
use crate::clock::PeriodGate;
use crate::collaborators::{FailureDetector, MessageSender};
use crate::error::MembershipResult;
use crate::group::GroupMembershipManager;
use crate::message::{
    ClusterMembershipMessagePart, ClusterMembershipResponseMessagePart, Destination, Message,
    MessagePart,
};
use crate::node::{Address, Node, NodeId};

/// Number of dissemination periods a worker has to acknowledge before the
/// coordinator resends
pub const WORKER_RESEND_PERIODS: u64 = 10;

struct PendingWorker {
    worker: NodeId,
    round_id: u64,
    membership_id: u64,
    sent_at: u64,
}

/// Keeps every worker node up to date with the installed cluster membership.
///
/// Runs on the core coordinator only. A worker that acknowledged the
/// previous membership receives the last delta restricted to the core domain
/// and its own domain; any other worker, or one that did not acknowledge an
/// earlier attempt, receives a full view of those domains.
pub struct WorkerClusterMembershipProtocol {
    local_node: Node,
    group_manager: Arc<GroupMembershipManager>,
    cluster_manager: Arc<ClusterMembershipManager>,
    failure_detector: Arc<dyn FailureDetector>,
    sender: Arc<dyn MessageSender>,
    gate: PeriodGate,
    resend_timeout_ms: u64,
    acknowledged: BTreeMap<NodeId, u64>,
    pending: BTreeMap<Address, PendingWorker>,
    last_round_id: u64,
    stopped: bool,
}

impl WorkerClusterMembershipProtocol {
    /// Create the protocol
    pub fn new(
        group_manager: Arc<GroupMembershipManager>,
        cluster_manager: Arc<ClusterMembershipManager>,
        failure_detector: Arc<dyn FailureDetector>,
        sender: Arc<dyn MessageSender>,
        dissemination_period_ms: u64,
    ) -> Self {
        Self {
            local_node: group_manager.local_node().clone(),
            group_manager,
            cluster_manager,
            failure_detector,
            sender,
            gate: PeriodGate::new(dissemination_period_ms),
            resend_timeout_ms: dissemination_period_ms.saturating_mul(WORKER_RESEND_PERIODS),
            acknowledged: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_round_id: 0,
            stopped: false,
        }
    }

    /// Latest membership id acknowledged by the worker
    pub fn acknowledged(&self, worker: &NodeId) -> Option<u64> {
        self.acknowledged.get(worker).copied()
    }

    /// Workers with an unacknowledged update
    pub fn pending_workers(&self) -> BTreeSet<NodeId> {
        self.pending.values().map(|pending| pending.worker).collect()
    }

    /// Stop disseminating
    pub fn stop(&mut self) {
        self.stopped = true;
        self.pending.clear();
    }

    /// One dissemination tick
    pub fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        if self.stopped || !self.gate.try_pass(now_ms) {
            return Ok(());
        }
        if !self.is_coordinator() {
            self.pending.clear();
            self.acknowledged.clear();
            return Ok(());
        }
        let Some(membership) = self.cluster_manager.membership() else {
            return Ok(());
        };

        let workers: Vec<Node> = membership.worker_nodes().cloned().collect();
        let ids: BTreeSet<NodeId> = workers.iter().map(Node::id).collect();
        self.pending.retain(|_, pending| ids.contains(&pending.worker));
        self.acknowledged.retain(|id, _| ids.contains(id));

        for worker in &workers {
            let acknowledged = self.acknowledged(&worker.id()).unwrap_or(0);
            if acknowledged >= membership.id() {
                continue;
            }

            let retry = match self.pending.get(worker.address()) {
                Some(pending) if pending.membership_id == membership.id() => {
                    if now_ms.saturating_sub(pending.sent_at) < self.resend_timeout_ms {
                        continue;
                    }
                    true
                }
                _ => false,
            };

            let increment = (!retry && acknowledged > 0 && acknowledged + 1 == membership.id())
                .then(|| self.cluster_manager.worker_increment(worker))
                .flatten();
            let Some(delta) = increment.or_else(|| self.cluster_manager.worker_view(worker)) else {
                continue;
            };

            self.last_round_id += 1;
            let round_id = self.last_round_id;
            trace!(
                "Round {}: sending cluster membership {} (full={}) to worker {}",
                round_id, delta.id, delta.full, worker
            );
            self.sender.send(Message::new(
                self.local_node.address().clone(),
                Destination::Node(worker.address().clone()),
                MessagePart::ClusterMembership(ClusterMembershipMessagePart { round_id, delta }),
            ))?;
            self.pending.insert(
                worker.address().clone(),
                PendingWorker {
                    worker: worker.id(),
                    round_id,
                    membership_id: membership.id(),
                    sent_at: now_ms,
                },
            );
        }

        Ok(())
    }

    /// Handle an acknowledgement; returns whether it came from a worker with
    /// an outstanding update
    pub fn on_response(
        &mut self,
        message: &Message,
        part: &ClusterMembershipResponseMessagePart,
    ) -> bool {
        let Some(pending) = self.pending.get(&message.source) else {
            return false;
        };
        if pending.round_id != part.round_id {
            trace!("Ignoring outdated acknowledgement from {}", message.source);
            return true;
        }

        debug!(
            "Worker {} acknowledged cluster membership {}",
            message.source, pending.membership_id
        );
        self.acknowledged.insert(pending.worker, pending.membership_id);
        self.pending.remove(&message.source);
        true
    }

    fn is_coordinator(&self) -> bool {
        let Some(membership) = self.group_manager.membership() else {
            return false;
        };
        let local_id = self.local_node.id();
        match self.failure_detector.current_coordinator() {
            Some(coordinator) => coordinator.id() == local_id,
            None => membership.group().coordinator().id() == local_id,
        }
    }
}
