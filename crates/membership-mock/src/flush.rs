use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use proven_membership::{
    FlushCoordinator, GroupMembership, GroupMembershipDelta, GroupMembershipManager, LeaveReason,
    MembershipResult,
};
use tracing::debug;

/// Flush coordinator that installs a membership on every registered
/// manager at once.
///
/// Managers of the new members prepare and commit immediately; registered
/// managers dropped from the group are uninstalled. Managers holding a
/// membership of another group, or one that does not precede the new
/// membership, are left alone.
#[derive(Default)]
pub struct ImmediateFlushCoordinator {
    managers: Mutex<Vec<Arc<GroupMembershipManager>>>,
    in_progress: AtomicBool,
    installs: AtomicUsize,
}

impl ImmediateFlushCoordinator {
    /// Create a coordinator with no managers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a manager to install memberships on
    pub fn register(&self, manager: Arc<GroupMembershipManager>) {
        self.managers.lock().push(manager);
    }

    /// Stop installing on a manager, for example once its node crashed
    pub fn unregister(&self, manager: &Arc<GroupMembershipManager>) {
        self.managers.lock().retain(|m| !Arc::ptr_eq(m, manager));
    }

    /// Pretend a flush is running
    pub fn set_in_progress(&self, in_progress: bool) {
        self.in_progress.store(in_progress, Ordering::SeqCst);
    }

    /// Number of completed installs
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

impl FlushCoordinator for ImmediateFlushCoordinator {
    fn install(
        &self,
        membership: GroupMembership,
        delta: Option<GroupMembershipDelta>,
    ) -> MembershipResult<()> {
        let managers = self.managers.lock().clone();
        let group_id = membership.group().id();

        for manager in managers {
            let local_id = manager.local_node().id();
            let is_member = membership.group().contains(&local_id);
            let current = manager.membership();
            let precedes = current.as_ref().is_some_and(|current| {
                current.group().id() == group_id && current.id() < membership.id()
            });

            match (is_member, current, &delta) {
                (true, None, _) => {
                    manager.prepare_install(membership.clone())?;
                    manager.commit()?;
                }
                (true, Some(current), Some(delta)) if precedes => {
                    if current.id() + 1 != membership.id() {
                        debug!(
                            "Skipping {}: installed {} is too old for {}",
                            manager.local_node(),
                            current,
                            membership
                        );
                        continue;
                    }
                    manager.prepare_change(membership.clone(), delta)?;
                    manager.commit()?;
                }
                (false, Some(_), Some(delta)) if precedes => {
                    let reason = if delta.group.left.contains(&local_id) {
                        LeaveReason::Graceful
                    } else {
                        LeaveReason::Failed
                    };
                    manager.uninstall(reason)?;
                }
                _ => {}
            }
        }

        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_flush_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}
