use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use proven_membership::{Address, Destination, MembershipResult, Message, MessageSender};
use tracing::trace;
use uuid::Uuid;

/// In-memory transport shared by every node of a test cluster.
///
/// Sent messages are queued until drained. Group destinations are expanded
/// to the members registered with [`set_group`](Self::set_group), the
/// sender excluded. Isolated addresses neither send nor receive.
#[derive(Default)]
pub struct MemoryNetwork {
    queue: Mutex<VecDeque<Message>>,
    groups: Mutex<BTreeMap<Uuid, Vec<Address>>>,
    isolated: Mutex<BTreeSet<Address>>,
    inboxes: Mutex<BTreeMap<Address, flume::Sender<Message>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender for the node at `address`
    pub fn sender(self: &Arc<Self>, address: impl Into<Address>) -> Arc<NetworkSender> {
        Arc::new(NetworkSender {
            network: self.clone(),
            address: address.into(),
        })
    }

    /// Set the members a group destination expands to
    pub fn set_group(&self, group_id: Uuid, members: Vec<Address>) {
        self.groups.lock().insert(group_id, members);
    }

    /// Drop all traffic from and to `address`
    pub fn isolate(&self, address: &Address) {
        self.isolated.lock().insert(address.clone());
    }

    /// Undo [`isolate`](Self::isolate)
    pub fn reconnect(&self, address: &Address) {
        self.isolated.lock().remove(address);
    }

    /// Deliver messages for `address` into a channel on
    /// [`deliver_all`](Self::deliver_all)
    pub fn connect(&self, address: Address, inbox: flume::Sender<Message>) {
        self.inboxes.lock().insert(address, inbox);
    }

    /// Number of queued messages
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Take every queued message as `(recipient, message)` pairs
    pub fn drain(&self) -> Vec<(Address, Message)> {
        let queued: Vec<Message> = self.queue.lock().drain(..).collect();
        let groups = self.groups.lock().clone();
        let isolated = self.isolated.lock().clone();

        let mut deliveries = Vec::new();
        for message in queued {
            match &message.destination {
                Destination::Node(address) => {
                    if !isolated.contains(address) {
                        deliveries.push((address.clone(), message));
                    }
                }
                Destination::Group(group) => {
                    let members = groups.get(&group.id).cloned().unwrap_or_default();
                    for member in members {
                        if member != message.source && !isolated.contains(&member) {
                            deliveries.push((member, message.clone()));
                        }
                    }
                }
            }
        }
        deliveries
    }

    /// Drain the queue into the connected inboxes; returns how many
    /// messages were delivered
    pub fn deliver_all(&self) -> usize {
        let deliveries = self.drain();
        let inboxes = self.inboxes.lock();
        let mut delivered = 0;
        for (recipient, message) in deliveries {
            match inboxes.get(&recipient) {
                Some(inbox) if inbox.send(message).is_ok() => delivered += 1,
                _ => trace!("No inbox for {}", recipient),
            }
        }
        delivered
    }

    fn enqueue(&self, message: Message) {
        if self.isolated.lock().contains(&message.source) {
            trace!("Dropping message from isolated {}", message.source);
            return;
        }
        self.queue.lock().push_back(message);
    }
}

/// [`MessageSender`] of one node on a [`MemoryNetwork`]
pub struct NetworkSender {
    network: Arc<MemoryNetwork>,
    address: Address,
}

impl NetworkSender {
    /// Address of the sending node
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl MessageSender for NetworkSender {
    fn send(&self, message: Message) -> MembershipResult<()> {
        trace!("{} sending to {}", self.address, message.destination);
        self.network.enqueue(message);
        Ok(())
    }
}

/// Sender that only records what it is given
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Message>>,
}

impl RecordingSender {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far
    pub fn messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Take the messages sent so far
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, message: Message) -> MembershipResult<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proven_membership::group::GroupAddress;

    fn payload(source: &str, destination: Destination) -> Message {
        Message::with_payload(Address::new(source), destination, Bytes::from_static(b"x"))
    }

    #[test]
    fn test_group_destination_skips_sender_and_isolated() {
        let network = MemoryNetwork::new();
        let group = GroupAddress::new(Uuid::from_u128(7), "g");
        network.set_group(
            group.id,
            vec![Address::new("a"), Address::new("b"), Address::new("c")],
        );
        network.isolate(&Address::new("c"));

        network
            .sender("a")
            .send(payload("a", Destination::Group(group)))
            .unwrap();

        let recipients: Vec<Address> = network.drain().into_iter().map(|(to, _)| to).collect();
        assert_eq!(recipients, vec![Address::new("b")]);
    }

    #[test]
    fn test_isolated_sender_is_dropped() {
        let network = MemoryNetwork::new();
        network.isolate(&Address::new("a"));
        network
            .sender("a")
            .send(payload("a", Destination::Node(Address::new("b"))))
            .unwrap();
        assert_eq!(network.pending(), 0);
    }

    #[test]
    fn test_deliver_all_feeds_inboxes() {
        let network = MemoryNetwork::new();
        let (tx, rx) = flume::unbounded();
        network.connect(Address::new("b"), tx);
        network
            .sender("a")
            .send(payload("a", Destination::Node(Address::new("b"))))
            .unwrap();
        network
            .sender("a")
            .send(payload("a", Destination::Node(Address::new("z"))))
            .unwrap();

        assert_eq!(network.deliver_all(), 1);
        assert_eq!(rx.try_recv().unwrap().source, Address::new("a"));
    }
}
