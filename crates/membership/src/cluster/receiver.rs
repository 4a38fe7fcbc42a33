//! Receiving side of cluster membership dissemination

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::manager::{ApplyOutcome, ClusterMembershipManager};
use super::membership::ClusterMembershipDelta;
use crate::collaborators::{MessageSender, StateTransferStore};
use crate::error::MembershipResult;
use crate::group::CORE_GROUP_ID;
use crate::message::{
    ClusterMembershipMessagePart, ClusterMembershipResponseMessagePart, Destination, Message,
    MessagePart,
};
use crate::node::Address;

/// Applies received cluster membership deltas and acknowledges them.
///
/// Stale deltas are acknowledged without being applied. A delta that does
/// not follow the installed membership is dropped unacknowledged so the
/// sender retries. A node with nothing installed recovers from the latest
/// saved full snapshot before applying an incremental delta.
pub struct ClusterMembershipReceiver {
    manager: Arc<ClusterMembershipManager>,
    sender: Arc<dyn MessageSender>,
    store: Option<Arc<dyn StateTransferStore>>,
    local_address: Address,
}

impl ClusterMembershipReceiver {
    /// Create a receiver for the membership held by `manager`
    pub fn new(
        manager: Arc<ClusterMembershipManager>,
        sender: Arc<dyn MessageSender>,
        store: Option<Arc<dyn StateTransferStore>>,
        local_address: Address,
    ) -> Self {
        Self {
            manager,
            sender,
            store,
            local_address,
        }
    }

    /// Handle a delta broadcast
    pub fn receive(
        &self,
        message: &Message,
        part: &ClusterMembershipMessagePart,
    ) -> MembershipResult<ApplyOutcome> {
        let mut outcome = self.manager.apply_delta(&part.delta)?;
        if outcome == ApplyOutcome::NeedsFull {
            outcome = self.recover(&part.delta)?;
        }

        match outcome {
            ApplyOutcome::Installed(_) | ApplyOutcome::Changed(_) | ApplyOutcome::Stale => {
                debug!(
                    "Acknowledging round {} (membership {}) to {}",
                    part.round_id, part.delta.id, message.source
                );
                self.sender.send(Message::new(
                    self.local_address.clone(),
                    Destination::Node(message.source.clone()),
                    MessagePart::ClusterMembershipResponse(ClusterMembershipResponseMessagePart {
                        round_id: part.round_id,
                    }),
                ))?;
            }
            ApplyOutcome::Gap { current, received } => {
                warn!(
                    "Dropping cluster membership {} from {}: installed is {}",
                    received, message.source, current
                );
            }
            ApplyOutcome::NeedsFull => {
                warn!(
                    "Dropping incremental cluster membership {} from {}: nothing installed",
                    part.delta.id, message.source
                );
            }
        }

        Ok(outcome)
    }

    fn recover(&self, delta: &ClusterMembershipDelta) -> MembershipResult<ApplyOutcome> {
        let Some(store) = &self.store else {
            return Ok(ApplyOutcome::NeedsFull);
        };
        let Some(snapshot) = store.load(CORE_GROUP_ID)? else {
            return Ok(ApplyOutcome::NeedsFull);
        };

        let restored = self.manager.apply_delta(&snapshot)?;
        if !restored.is_applied() {
            return Ok(ApplyOutcome::NeedsFull);
        }
        info!("Restored cluster membership {} from snapshot", snapshot.id);

        if delta.id <= snapshot.id {
            return Ok(restored);
        }
        self.manager.apply_delta(delta)
    }
}
