//! Agreement and dissemination of the cluster membership among core nodes

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::manager::ClusterMembershipManager;
use super::membership::ClusterMembershipDelta;
use crate::clock::PeriodGate;
use crate::collaborators::{FailureDetector, FlushCoordinator, MessageSender, StateTransferStore};
use crate::error::{MembershipResult, ensure_invariant};
use crate::group::{CORE_GROUP_ID, GroupAddress, GroupMembership, GroupMembershipManager};
use crate::message::{
    ClusterMembershipMessagePart, ClusterMembershipResponseMessagePart, Destination, Message,
    MessagePart,
};
use crate::node::{Address, Node, NodeId};

struct Round {
    id: u64,
    group_membership_id: u64,
    pending: BTreeSet<Address>,
}

/// Runs dissemination rounds on the core coordinator.
///
/// At most one round is outstanding. The coordinator builds the next delta
/// from the providers, applies it locally, saves a full snapshot and
/// broadcasts it to the core group; the next round starts once every live
/// member acknowledged. If the core group changes while a round is
/// outstanding, the round is abandoned and the last delta is reasserted to
/// the new members under a fresh round id.
///
/// The reassertion resends the whole last delta, every domain included,
/// with its membership id unchanged; it is not narrowed to the core domain.
/// Members already holding that id acknowledge it as stale, while a member
/// that missed it applies it as the regular next increment.
pub struct CoreClusterMembershipProtocol {
    local_node: Node,
    group_manager: Arc<GroupMembershipManager>,
    cluster_manager: Arc<ClusterMembershipManager>,
    failure_detector: Arc<dyn FailureDetector>,
    flush: Arc<dyn FlushCoordinator>,
    sender: Arc<dyn MessageSender>,
    store: Option<Arc<dyn StateTransferStore>>,
    gate: PeriodGate,
    round: Option<Round>,
    last_round_id: u64,
    reassert: bool,
    stopped: bool,
}

impl CoreClusterMembershipProtocol {
    /// Create the protocol for the core group held by `group_manager`
    pub fn new(
        group_manager: Arc<GroupMembershipManager>,
        cluster_manager: Arc<ClusterMembershipManager>,
        failure_detector: Arc<dyn FailureDetector>,
        flush: Arc<dyn FlushCoordinator>,
        sender: Arc<dyn MessageSender>,
        store: Option<Arc<dyn StateTransferStore>>,
        dissemination_period_ms: u64,
    ) -> Self {
        Self {
            local_node: group_manager.local_node().clone(),
            group_manager,
            cluster_manager,
            failure_detector,
            flush,
            sender,
            store,
            gate: PeriodGate::new(dissemination_period_ms),
            round: None,
            last_round_id: 0,
            reassert: false,
            stopped: false,
        }
    }

    /// Id of the outstanding round
    pub fn outstanding_round(&self) -> Option<u64> {
        self.round.as_ref().map(|round| round.id)
    }

    /// Members whose acknowledgement is still awaited
    pub fn pending_acks(&self) -> BTreeSet<Address> {
        self.round
            .as_ref()
            .map(|round| round.pending.clone())
            .unwrap_or_default()
    }

    /// Whether the last delta will be reasserted on the next opportunity
    pub fn is_reassert_pending(&self) -> bool {
        self.reassert
    }

    /// Stop running rounds
    pub fn stop(&mut self) {
        self.stopped = true;
        self.round = None;
    }

    /// Whether the protocol was stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// One dissemination tick
    pub fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        if self.stopped || !self.gate.try_pass(now_ms) {
            return Ok(());
        }

        let membership = self.group_manager.membership();
        let departed = membership
            .as_deref()
            .map(|membership| self.departed_members(membership))
            .unwrap_or_default();

        if let Some(round) = &self.round {
            let group_changed = membership.as_ref().map(|m| m.id()) != Some(round.group_membership_id);
            let member_departed = membership.as_deref().is_some_and(|membership| {
                membership
                    .group()
                    .members()
                    .iter()
                    .any(|m| departed.contains(&m.id()) && round.pending.contains(m.address()))
            });
            if group_changed || member_departed {
                warn!(
                    "Abandoning round {} with {} acknowledgements outstanding",
                    round.id,
                    round.pending.len()
                );
                self.round = None;
                self.reassert = true;
            } else {
                return Ok(());
            }
        }

        let Some(membership) = membership else {
            return Ok(());
        };
        if self.flush.is_flush_in_progress()
            || self.group_manager.has_outstanding_change()
            || !self.is_coordinator(&membership)
        {
            return Ok(());
        }

        if self.reassert {
            self.reassert = false;
            if let Some(delta) = self.cluster_manager.last_delta() {
                info!("Reasserting cluster membership {}", delta.id);
                self.broadcast((*delta).clone(), &membership, &departed)?;
            }
            return Ok(());
        }

        if !departed.is_empty() {
            debug!("Waiting for {} departed core members to be removed", departed.len());
            return Ok(());
        }

        let Some(delta) = self.cluster_manager.build_delta()? else {
            return Ok(());
        };
        let outcome = self.cluster_manager.apply_delta(&delta)?;
        ensure_invariant!(
            outcome.is_applied(),
            "coordinator could not apply its own cluster membership {}: {:?}",
            delta.id,
            outcome
        );

        if let (Some(store), Some(snapshot)) = (&self.store, self.cluster_manager.full_snapshot()) {
            store.save(CORE_GROUP_ID, snapshot)?;
        }

        self.broadcast(delta, &membership, &departed)
    }

    /// Handle an acknowledgement; returns whether it belonged to the
    /// outstanding round
    pub fn on_response(
        &mut self,
        message: &Message,
        part: &ClusterMembershipResponseMessagePart,
    ) -> bool {
        let Some(round) = &mut self.round else {
            return false;
        };
        if round.id != part.round_id || !round.pending.remove(&message.source) {
            return false;
        }

        if round.pending.is_empty() {
            debug!("Round {} acknowledged by every core member", round.id);
            self.round = None;
        }
        true
    }

    fn is_coordinator(&self, membership: &GroupMembership) -> bool {
        let local_id = self.local_node.id();
        match self.failure_detector.current_coordinator() {
            Some(coordinator) => coordinator.id() == local_id,
            None => membership.group().coordinator().id() == local_id,
        }
    }

    fn departed_members(&self, membership: &GroupMembership) -> BTreeSet<NodeId> {
        let group = membership.group();
        self.failure_detector
            .failed_members()
            .into_iter()
            .chain(self.failure_detector.left_members())
            .map(|node| node.id())
            .filter(|id| *id != self.local_node.id() && group.contains(id))
            .collect()
    }

    fn broadcast(
        &mut self,
        delta: ClusterMembershipDelta,
        membership: &GroupMembership,
        departed: &BTreeSet<NodeId>,
    ) -> MembershipResult<()> {
        self.last_round_id += 1;
        let round_id = self.last_round_id;
        let pending: BTreeSet<Address> = membership
            .group()
            .members()
            .iter()
            .filter(|m| m.id() != self.local_node.id() && !departed.contains(&m.id()))
            .map(|m| m.address().clone())
            .collect();

        debug!(
            "Round {}: broadcasting cluster membership {} to {} core members",
            round_id,
            delta.id,
            pending.len()
        );
        self.sender.send(Message::new(
            self.local_node.address().clone(),
            Destination::Group(GroupAddress::core()),
            MessagePart::ClusterMembership(ClusterMembershipMessagePart { round_id, delta }),
        ))?;

        self.round = (!pending.is_empty()).then(|| Round {
            id: round_id,
            group_membership_id: membership.id(),
            pending,
        });
        Ok(())
    }
}
