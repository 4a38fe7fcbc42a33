//! Wire codec for membership messages
//!
//! Every part is encoded as a `(type tag, version, CBOR body)` triple. On
//! decode the type tag selects a decoder from the [`PartRegistry`] dispatch
//! table.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MembershipError, MembershipResult};
use crate::message::{
    ClusterMembershipMessagePart, ClusterMembershipResponseMessagePart, Destination,
    DiscoveryMessagePart, GroupJoinMessagePart, GroupMessagePart, Message, MessagePart,
    MembershipResponseMessagePart, PartKind,
};
use crate::node::Address;

/// Encoded message part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePart {
    /// Stable type tag of the part
    pub type_id: Uuid,
    /// Wire format version
    pub version: u8,
    /// CBOR encoded body
    pub body: Bytes,
}

/// Encoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WireMessage {
    source: Address,
    destination: Destination,
    parts: Vec<WirePart>,
    payload: Bytes,
}

type PartDecoder = fn(&[u8]) -> MembershipResult<MessagePart>;

struct Registration {
    kind: PartKind,
    version: u8,
    decode: PartDecoder,
}

/// Dispatch table from type tag to part decoder
pub struct PartRegistry {
    decoders: HashMap<Uuid, Registration>,
}

impl PartRegistry {
    /// Create an empty registry
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Create a registry knowing every membership part
    pub fn with_membership_parts() -> Self {
        let mut registry = Self::empty();
        for kind in PartKind::ALL {
            registry.insert(kind, decoder_for(kind));
        }
        registry
    }

    /// Register a decoder for a part kind
    pub fn register(&mut self, kind: PartKind, decode: PartDecoder) -> MembershipResult<()> {
        let type_id = kind.type_id();
        if self.decoders.contains_key(&type_id) {
            return Err(MembershipError::invariant(format!(
                "part type {type_id} registered twice"
            )));
        }

        self.insert(kind, decode);
        Ok(())
    }

    fn insert(&mut self, kind: PartKind, decode: PartDecoder) {
        self.decoders.insert(
            kind.type_id(),
            Registration {
                kind,
                version: kind.version(),
                decode,
            },
        );
    }

    /// Whether a type tag is known
    pub fn contains(&self, type_id: &Uuid) -> bool {
        self.decoders.contains_key(type_id)
    }

    /// Encode one part
    pub fn encode_part(&self, part: &MessagePart) -> MembershipResult<WirePart> {
        let kind = part.kind();
        if !self.contains(&kind.type_id()) {
            return Err(MembershipError::Serialization(format!(
                "part kind {kind:?} is not registered"
            )));
        }

        let body = match part {
            MessagePart::Discovery(p) => to_cbor(p)?,
            MessagePart::GroupJoin(p) => to_cbor(p)?,
            MessagePart::MembershipResponse(p) => to_cbor(p)?,
            MessagePart::ClusterMembership(p) => to_cbor(p)?,
            MessagePart::ClusterMembershipResponse(p) => to_cbor(p)?,
            MessagePart::Group(p) => to_cbor(p)?,
        };

        Ok(WirePart {
            type_id: kind.type_id(),
            version: kind.version(),
            body: Bytes::from(body),
        })
    }

    /// Decode one part through the dispatch table
    pub fn decode_part(&self, part: &WirePart) -> MembershipResult<MessagePart> {
        let registration = self.decoders.get(&part.type_id).ok_or_else(|| {
            MembershipError::Serialization(format!("unknown part type {}", part.type_id))
        })?;

        if registration.version != part.version {
            return Err(MembershipError::Serialization(format!(
                "part {:?} has version {}, expected {}",
                registration.kind, part.version, registration.version
            )));
        }

        (registration.decode)(&part.body)
    }

    /// Encode a whole message
    pub fn encode_message(&self, message: &Message) -> MembershipResult<Bytes> {
        let parts = message
            .parts()
            .iter()
            .map(|part| self.encode_part(part))
            .collect::<MembershipResult<Vec<_>>>()?;

        let wire = WireMessage {
            source: message.source.clone(),
            destination: message.destination.clone(),
            parts,
            payload: message.payload.clone(),
        };

        to_cbor(&wire).map(Bytes::from)
    }

    /// Decode a whole message
    pub fn decode_message(&self, bytes: &[u8]) -> MembershipResult<Message> {
        let wire: WireMessage = from_cbor(bytes)?;
        let parts = wire
            .parts
            .iter()
            .map(|part| self.decode_part(part))
            .collect::<MembershipResult<Vec<_>>>()?;

        Ok(Message::from_parts(
            wire.source,
            wire.destination,
            parts,
            wire.payload,
        ))
    }
}

impl Default for PartRegistry {
    fn default() -> Self {
        Self::with_membership_parts()
    }
}

fn decoder_for(kind: PartKind) -> PartDecoder {
    match kind {
        PartKind::Discovery => decode_discovery,
        PartKind::GroupJoin => decode_group_join,
        PartKind::MembershipResponse => decode_membership_response,
        PartKind::ClusterMembership => decode_cluster_membership,
        PartKind::ClusterMembershipResponse => decode_cluster_membership_response,
        PartKind::Group => decode_group,
    }
}

fn decode_discovery(bytes: &[u8]) -> MembershipResult<MessagePart> {
    from_cbor::<DiscoveryMessagePart>(bytes).map(MessagePart::Discovery)
}

fn decode_group_join(bytes: &[u8]) -> MembershipResult<MessagePart> {
    from_cbor::<GroupJoinMessagePart>(bytes).map(MessagePart::GroupJoin)
}

fn decode_membership_response(bytes: &[u8]) -> MembershipResult<MessagePart> {
    let part: MembershipResponseMessagePart = from_cbor(bytes)?;
    // the member list must be re-validated
    MembershipResponseMessagePart::new(part.membership_id, part.healthy_members)
        .map(MessagePart::MembershipResponse)
}

fn decode_cluster_membership(bytes: &[u8]) -> MembershipResult<MessagePart> {
    from_cbor::<ClusterMembershipMessagePart>(bytes).map(MessagePart::ClusterMembership)
}

fn decode_cluster_membership_response(bytes: &[u8]) -> MembershipResult<MessagePart> {
    from_cbor::<ClusterMembershipResponseMessagePart>(bytes)
        .map(MessagePart::ClusterMembershipResponse)
}

fn decode_group(bytes: &[u8]) -> MembershipResult<MessagePart> {
    from_cbor::<GroupMessagePart>(bytes).map(MessagePart::Group)
}

fn to_cbor<T: Serialize>(value: &T) -> MembershipResult<Vec<u8>> {
    let mut data = Vec::new();
    ciborium::ser::into_writer(value, &mut data)
        .map_err(|e| MembershipError::Serialization(format!("Failed to encode: {e}")))?;
    Ok(data)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> MembershipResult<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| MembershipError::Serialization(format!("Failed to decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupAddress;
    use crate::node::{CORE_DOMAIN, Node, NodeId};
    use std::collections::BTreeSet;

    fn discovery_message() -> Message {
        let node = Node::new(NodeId::from_u128(1), "a", "a:1", CORE_DOMAIN)
            .with_property("zone", serde_json::json!("eu-1"));
        let mut message = Message::new(
            Address::new("a:1"),
            Destination::Group(GroupAddress::core()),
            MessagePart::Discovery(DiscoveryMessagePart {
                discovered_nodes: BTreeSet::from([node]),
                core: true,
            }),
        );
        message.push_part(MessagePart::Group(GroupMessagePart {
            group_id: Uuid::new_v4(),
        }));
        message.payload = Bytes::from_static(b"app");
        message
    }

    #[test]
    fn test_message_survives_encoding() {
        let registry = PartRegistry::default();
        let message = discovery_message();

        let bytes = registry.encode_message(&message).unwrap();
        let decoded = registry.decode_message(&bytes).unwrap();

        assert_eq!(decoded, message);
        match decoded.parts().first() {
            Some(MessagePart::Discovery(part)) => {
                let node = part.discovered_nodes.iter().next().unwrap();
                assert_eq!(node.property("zone"), Some(&serde_json::json!("eu-1")));
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = PartRegistry::default();
        let part = WirePart {
            type_id: Uuid::new_v4(),
            version: 1,
            body: Bytes::new(),
        };

        assert!(matches!(
            registry.decode_part(&part),
            Err(MembershipError::Serialization(_))
        ));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let registry = PartRegistry::default();
        let mut part = registry
            .encode_part(&MessagePart::ClusterMembershipResponse(
                ClusterMembershipResponseMessagePart { round_id: 9 },
            ))
            .unwrap();
        part.version = 2;

        assert!(matches!(
            registry.decode_part(&part),
            Err(MembershipError::Serialization(_))
        ));
    }

    #[test]
    fn test_empty_registry_refuses_to_encode() {
        let registry = PartRegistry::empty();
        let part = MessagePart::Group(GroupMessagePart {
            group_id: Uuid::new_v4(),
        });

        assert!(registry.encode_part(&part).is_err());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PartRegistry::with_membership_parts();
        let result = registry.register(PartKind::Group, decoder_for(PartKind::Group));

        assert!(result.unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_membership_registry_knows_every_part() {
        let registry = PartRegistry::with_membership_parts();

        for kind in PartKind::ALL {
            assert!(registry.contains(&kind.type_id()), "{kind:?} not registered");
        }
    }
}
