//! Agreed view of one group and its two-phase install lifecycle

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::membership::{GroupMembership, GroupMembershipChange, GroupMembershipDelta};
use crate::error::{MembershipError, MembershipResult, ensure_invariant};
use crate::listener::{ListenerRegistry, ListenerResult, dispatch};
use crate::node::Node;

/// Why the local node stopped being a member of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The node asked to leave
    Graceful,
    /// The rest of the group considers the node failed
    Failed,
    /// The stack is shutting down
    Shutdown,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful exit"),
            Self::Failed => f.write_str("failed"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Observer of prepared (not yet authoritative) memberships
pub trait PreparedGroupMembershipListener: Send + Sync {
    /// First membership prepared
    fn on_prepare_install(&self, _membership: &GroupMembership) -> ListenerResult {
        Ok(())
    }

    /// Next membership prepared
    fn on_prepare_change(&self, _change: &GroupMembershipChange) -> ListenerResult {
        Ok(())
    }
}

/// Observer of committed memberships
pub trait GroupMembershipListener: Send + Sync {
    /// First membership committed
    fn on_joined(&self, _membership: &GroupMembership) -> ListenerResult {
        Ok(())
    }

    /// Subsequent membership committed
    fn on_membership_changed(&self, _change: &GroupMembershipChange) -> ListenerResult {
        Ok(())
    }

    /// Membership uninstalled
    fn on_left(&self, _reason: LeaveReason) -> ListenerResult {
        Ok(())
    }
}

/// Holds the agreed membership of one group.
///
/// The flush coordinator drives `prepare_*` and `commit`; every other
/// component only reads.
pub struct GroupMembershipManager {
    local_node: Node,
    current: ArcSwapOption<GroupMembership>,
    prepared: ArcSwapOption<GroupMembership>,
    prepared_change: Mutex<Option<GroupMembershipChange>>,
    private_prepared_listeners: Vec<Arc<dyn PreparedGroupMembershipListener>>,
    private_listeners: Vec<Arc<dyn GroupMembershipListener>>,
    prepared_listeners: ListenerRegistry<dyn PreparedGroupMembershipListener>,
    listeners: ListenerRegistry<dyn GroupMembershipListener>,
}

impl GroupMembershipManager {
    /// Create a manager without private listeners
    pub fn new(local_node: Node) -> Self {
        Self::with_private_listeners(local_node, Vec::new(), Vec::new())
    }

    /// Create a manager with listeners fixed at wiring time
    pub fn with_private_listeners(
        local_node: Node,
        private_prepared_listeners: Vec<Arc<dyn PreparedGroupMembershipListener>>,
        private_listeners: Vec<Arc<dyn GroupMembershipListener>>,
    ) -> Self {
        Self {
            local_node,
            current: ArcSwapOption::empty(),
            prepared: ArcSwapOption::empty(),
            prepared_change: Mutex::new(None),
            private_prepared_listeners,
            private_listeners,
            prepared_listeners: ListenerRegistry::new(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Local node
    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    /// Committed membership
    pub fn membership(&self) -> Option<Arc<GroupMembership>> {
        self.current.load_full()
    }

    /// Last prepared membership (equal to the committed one when nothing is outstanding)
    pub fn prepared_membership(&self) -> Option<Arc<GroupMembership>> {
        self.prepared.load_full()
    }

    /// Whether a prepared membership awaits commit
    pub fn has_outstanding_change(&self) -> bool {
        match (self.prepared.load_full(), self.current.load_full()) {
            (Some(prepared), Some(current)) => prepared.id() != current.id(),
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Whether the local node coordinates the committed membership
    pub fn is_coordinator(&self) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|m| m.group().coordinator().id() == self.local_node.id())
    }

    /// Register a public listener
    pub fn add_listener(&self, listener: Arc<dyn GroupMembershipListener>) {
        self.listeners.add(listener);
    }

    /// Remove a public listener
    pub fn remove_listener(&self, listener: &Arc<dyn GroupMembershipListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Register a public prepared-membership listener
    pub fn add_prepared_listener(&self, listener: Arc<dyn PreparedGroupMembershipListener>) {
        self.prepared_listeners.add(listener);
    }

    /// Remove a public prepared-membership listener
    pub fn remove_prepared_listener(
        &self,
        listener: &Arc<dyn PreparedGroupMembershipListener>,
    ) -> bool {
        self.prepared_listeners.remove(listener)
    }

    /// Prepare the first membership of the group
    pub fn prepare_install(&self, membership: GroupMembership) -> MembershipResult<()> {
        self.ensure_local_member(&membership)?;
        ensure_invariant!(
            self.current.load().is_none(),
            "cannot prepare install of {}: a membership is already installed",
            membership
        );

        debug!("Prepared install of {}", membership);

        let membership = Arc::new(membership);
        self.prepared.store(Some(membership.clone()));
        *self.prepared_change.lock() = None;

        dispatch(
            "prepare install",
            &self.private_prepared_listeners,
            |l| l.on_prepare_install(&membership),
        )?;
        dispatch(
            "prepare install",
            self.prepared_listeners.snapshot().as_slice(),
            |l| l.on_prepare_install(&membership),
        )
    }

    /// Prepare the membership following the committed one
    pub fn prepare_change(
        &self,
        membership: GroupMembership,
        delta: &GroupMembershipDelta,
    ) -> MembershipResult<()> {
        self.ensure_local_member(&membership)?;

        let current = self.current.load_full().ok_or_else(|| {
            MembershipError::invariant(format!(
                "cannot prepare change to {membership}: nothing is installed"
            ))
        })?;
        ensure_invariant!(
            membership.id() == current.id() + 1,
            "prepared membership {} does not follow installed membership {}",
            membership.id(),
            current.id()
        );
        ensure_invariant!(
            !self.has_outstanding_change(),
            "membership change already outstanding for group {}",
            current.group().name()
        );

        debug!("Prepared change to {}", membership);

        let change = GroupMembershipChange::new(&current, membership.clone(), delta);
        self.prepared.store(Some(Arc::new(membership)));
        *self.prepared_change.lock() = Some(change.clone());

        dispatch(
            "prepare change",
            &self.private_prepared_listeners,
            |l| l.on_prepare_change(&change),
        )?;
        dispatch(
            "prepare change",
            self.prepared_listeners.snapshot().as_slice(),
            |l| l.on_prepare_change(&change),
        )
    }

    /// Make the prepared membership authoritative
    pub fn commit(&self) -> MembershipResult<()> {
        ensure_invariant!(
            self.has_outstanding_change(),
            "no prepared membership to commit for {}",
            self.local_node
        );

        let prepared = self.prepared.load_full().ok_or_else(|| {
            MembershipError::invariant("prepared membership vanished before commit")
        })?;
        let change = self.prepared_change.lock().take();
        self.current.store(Some(prepared.clone()));

        info!("Installed {}", prepared);

        match change {
            None => {
                dispatch("joined", &self.private_listeners, |l| l.on_joined(&prepared))?;
                dispatch("joined", self.listeners.snapshot().as_slice(), |l| {
                    l.on_joined(&prepared)
                })
            }
            Some(change) => {
                dispatch("membership changed", &self.private_listeners, |l| {
                    l.on_membership_changed(&change)
                })?;
                dispatch(
                    "membership changed",
                    self.listeners.snapshot().as_slice(),
                    |l| l.on_membership_changed(&change),
                )
            }
        }
    }

    /// Drop the installed membership; no-op when nothing is installed
    pub fn uninstall(&self, reason: LeaveReason) -> MembershipResult<()> {
        let current = self.current.swap(None);
        let prepared = self.prepared.swap(None);
        *self.prepared_change.lock() = None;

        if current.is_none() && prepared.is_none() {
            return Ok(());
        }

        info!("Uninstalled membership of {} ({})", self.local_node, reason);

        dispatch("left", &self.private_listeners, |l| l.on_left(reason))?;
        dispatch("left", self.listeners.snapshot().as_slice(), |l| {
            l.on_left(reason)
        })
    }

    fn ensure_local_member(&self, membership: &GroupMembership) -> MembershipResult<()> {
        ensure_invariant!(
            membership.group().contains(&self.local_node.id()),
            "local node {} is not a member of {}",
            self.local_node,
            membership
        );
        Ok(())
    }
}
