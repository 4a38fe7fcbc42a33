//! Per-group substacks on worker nodes

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterMembershipManager;
use crate::collaborators::MessageSender;
use crate::error::{MembershipError, MembershipResult};
use crate::group::Group;
use crate::message::{Destination, GroupMessagePart, Message, MessagePart};
use crate::node::Node;

/// Protocol stack serving one group the local node belongs to
pub trait GroupSubstack: Send {
    /// Handle a message addressed to the group; the group envelope is
    /// already removed
    fn receive(&mut self, message: Message) -> MembershipResult<()>;

    /// Periodic tick
    fn on_timer(&mut self, _now_ms: u64) -> MembershipResult<()> {
        Ok(())
    }

    /// The group's membership changed
    fn on_group_changed(&mut self, _group: &Group) -> MembershipResult<()> {
        Ok(())
    }

    /// Tear down; no further calls follow
    fn stop(&mut self) {}
}

/// Creates a substack for a group the local node joined
pub trait GroupSubstackFactory: Send + Sync {
    /// Create the substack of `group`
    fn create(&self, group: &Group) -> MembershipResult<Box<dyn GroupSubstack>>;
}

/// What [`GroupRouter::receive`] did with a message
#[derive(Debug)]
pub enum RouteOutcome {
    /// Handed to a substack
    Delivered,
    /// Not addressed to a known group; the message is returned untouched
    Unhandled(Message),
}

struct Route {
    group: Group,
    substack: Box<dyn GroupSubstack>,
    removed_at: Option<u64>,
}

/// Routes group traffic to per-group substacks.
///
/// The set of substacks follows the local node's groups in the installed
/// cluster membership. A substack of a group the node no longer belongs to
/// keeps receiving for a grace delay before it is torn down.
pub struct GroupRouter {
    local_node: Node,
    cluster_manager: Arc<ClusterMembershipManager>,
    factory: Arc<dyn GroupSubstackFactory>,
    sender: Arc<dyn MessageSender>,
    removal_delay_ms: u64,
    routes: BTreeMap<Uuid, Route>,
    synced_membership: Option<u64>,
}

impl GroupRouter {
    /// Create a router for the local node
    pub fn new(
        local_node: Node,
        cluster_manager: Arc<ClusterMembershipManager>,
        factory: Arc<dyn GroupSubstackFactory>,
        sender: Arc<dyn MessageSender>,
        removal_delay_ms: u64,
    ) -> Self {
        Self {
            local_node,
            cluster_manager,
            factory,
            sender,
            removal_delay_ms,
            routes: BTreeMap::new(),
            synced_membership: None,
        }
    }

    /// Groups with a live substack
    pub fn active_groups(&self) -> BTreeSet<Uuid> {
        self.routes
            .iter()
            .filter(|(_, route)| route.removed_at.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Groups whose substack awaits teardown
    pub fn removed_groups(&self) -> BTreeSet<Uuid> {
        self.routes
            .iter()
            .filter(|(_, route)| route.removed_at.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Current view of a routed group
    pub fn group(&self, group_id: &Uuid) -> Option<&Group> {
        self.routes.get(group_id).map(|route| &route.group)
    }

    /// Send `message` to every member of an active group
    pub fn send(&self, group_id: Uuid, mut message: Message) -> MembershipResult<()> {
        let route = self
            .routes
            .get(&group_id)
            .filter(|route| route.removed_at.is_none())
            .ok_or_else(|| {
                MembershipError::invalid_argument(format!(
                    "node {} is not a member of group {}",
                    self.local_node, group_id
                ))
            })?;

        message.push_part(MessagePart::Group(GroupMessagePart { group_id }));
        message.destination = Destination::Group(route.group.address());
        self.sender.send(message)
    }

    /// Deliver a message carrying a group envelope to its substack
    pub fn receive(&mut self, mut message: Message) -> MembershipResult<RouteOutcome> {
        let Some(MessagePart::Group(part)) = message.top_part() else {
            return Ok(RouteOutcome::Unhandled(message));
        };
        let group_id = part.group_id;
        let Some(route) = self.routes.get_mut(&group_id) else {
            debug!("No substack for group {}, message from {}", group_id, message.source);
            return Ok(RouteOutcome::Unhandled(message));
        };

        message.pop_part();
        route.substack.receive(message)?;
        Ok(RouteOutcome::Delivered)
    }

    /// Follow the installed membership, tick the substacks and tear down
    /// substacks whose grace delay expired
    pub fn on_timer(&mut self, now_ms: u64) -> MembershipResult<()> {
        self.sync(now_ms)?;

        for (group_id, route) in self.routes.iter_mut() {
            if route.removed_at.is_none() {
                if let Err(err) = route.substack.on_timer(now_ms) {
                    warn!("Substack of group {} failed on timer: {}", group_id, err);
                }
            }
        }

        let delay = self.removal_delay_ms;
        let expired: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|(_, route)| {
                route
                    .removed_at
                    .is_some_and(|removed_at| now_ms.saturating_sub(removed_at) >= delay)
            })
            .map(|(id, _)| *id)
            .collect();
        for group_id in expired {
            if let Some(mut route) = self.routes.remove(&group_id) {
                info!("Tearing down substack of group {}", route.group.name());
                route.substack.stop();
            }
        }

        Ok(())
    }

    /// Tear down every substack
    pub fn stop(&mut self) {
        for (_, mut route) in std::mem::take(&mut self.routes) {
            route.substack.stop();
        }
        self.synced_membership = None;
    }

    fn sync(&mut self, now_ms: u64) -> MembershipResult<()> {
        let membership = self.cluster_manager.membership();
        let membership_id = membership.as_ref().map(|m| m.id());
        if membership_id == self.synced_membership {
            return Ok(());
        }

        let local_id = self.local_node.id();
        let groups: BTreeMap<Uuid, Group> = membership
            .as_deref()
            .and_then(|m| m.domain(self.local_node.domain()))
            .and_then(|domain| domain.groups())
            .map(|groups| {
                groups
                    .groups_of(&local_id)
                    .map(|group| (group.id(), group.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (group_id, route) in self.routes.iter_mut() {
            if route.removed_at.is_none() && !groups.contains_key(group_id) {
                info!(
                    "Node {} left group {}, substack kept for {} ms",
                    self.local_node,
                    route.group.name(),
                    self.removal_delay_ms
                );
                route.removed_at = Some(now_ms);
            }
        }

        for (group_id, group) in groups {
            match self.routes.get_mut(&group_id) {
                Some(route) => {
                    let revived = route.removed_at.take().is_some();
                    if revived || route.group != group {
                        route.substack.on_group_changed(&group)?;
                        route.group = group;
                    }
                }
                None => {
                    info!("Node {} joined group {}", self.local_node, group);
                    let substack = self.factory.create(&group)?;
                    self.routes.insert(
                        group_id,
                        Route {
                            group,
                            substack,
                            removed_at: None,
                        },
                    );
                }
            }
        }

        self.synced_membership = membership_id;
        Ok(())
    }
}
