use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use proven_membership::{
    Address, Group, GroupSubstack, GroupSubstackFactory, MembershipResult, Message,
};
use uuid::Uuid;

/// Something that happened to a substack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstackEvent {
    /// Substack created for a group with that many members
    Created {
        /// Group id
        group: Uuid,
        /// Member count at creation
        members: usize,
    },
    /// Message delivered to the substack
    Received {
        /// Group id
        group: Uuid,
        /// Sender
        source: Address,
        /// Message payload
        payload: Bytes,
    },
    /// Group membership changed
    Changed {
        /// Group id
        group: Uuid,
        /// Change id of the new group view
        change_id: u64,
    },
    /// Substack torn down
    Stopped {
        /// Group id
        group: Uuid,
    },
}

/// Factory of substacks that record every event in a shared log
#[derive(Default)]
pub struct RecordingSubstackFactory {
    events: Arc<Mutex<Vec<SubstackEvent>>>,
}

impl RecordingSubstackFactory {
    /// Create a factory with an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<SubstackEvent> {
        self.events.lock().clone()
    }

    /// Events of one group
    pub fn events_of(&self, group: Uuid) -> Vec<SubstackEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event_group(event) == group)
            .cloned()
            .collect()
    }
}

fn event_group(event: &SubstackEvent) -> Uuid {
    match event {
        SubstackEvent::Created { group, .. }
        | SubstackEvent::Received { group, .. }
        | SubstackEvent::Changed { group, .. }
        | SubstackEvent::Stopped { group } => *group,
    }
}

impl GroupSubstackFactory for RecordingSubstackFactory {
    fn create(&self, group: &Group) -> MembershipResult<Box<dyn GroupSubstack>> {
        self.events.lock().push(SubstackEvent::Created {
            group: group.id(),
            members: group.members().len(),
        });
        Ok(Box::new(RecordingSubstack {
            group: group.id(),
            events: self.events.clone(),
        }))
    }
}

struct RecordingSubstack {
    group: Uuid,
    events: Arc<Mutex<Vec<SubstackEvent>>>,
}

impl GroupSubstack for RecordingSubstack {
    fn receive(&mut self, message: Message) -> MembershipResult<()> {
        self.events.lock().push(SubstackEvent::Received {
            group: self.group,
            source: message.source,
            payload: message.payload,
        });
        Ok(())
    }

    fn on_group_changed(&mut self, group: &Group) -> MembershipResult<()> {
        self.events.lock().push(SubstackEvent::Changed {
            group: self.group,
            change_id: group.change_id(),
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.events
            .lock()
            .push(SubstackEvent::Stopped { group: self.group });
    }
}
