use std::collections::BTreeMap;

use parking_lot::Mutex;
use proven_membership::{ClusterMembershipDelta, MembershipResult, StateTransferStore};
use uuid::Uuid;

/// Snapshot store kept in memory
#[derive(Default)]
pub struct MemoryStateTransferStore {
    snapshots: Mutex<BTreeMap<Uuid, ClusterMembershipDelta>>,
}

impl MemoryStateTransferStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the snapshot saved under `key`
    pub fn saved_id(&self, key: Uuid) -> Option<u64> {
        self.snapshots.lock().get(&key).map(|snapshot| snapshot.id)
    }
}

impl StateTransferStore for MemoryStateTransferStore {
    fn save(&self, key: Uuid, snapshot: ClusterMembershipDelta) -> MembershipResult<()> {
        self.snapshots.lock().insert(key, snapshot);
        Ok(())
    }

    fn load(&self, key: Uuid) -> MembershipResult<Option<ClusterMembershipDelta>> {
        Ok(self.snapshots.lock().get(&key).cloned())
    }
}
