//! Composite cluster membership: domains, providers, agreement and
//! dissemination

mod definition;
mod element;
mod filter;
mod manager;
mod mapping;
mod membership;
mod protocol;
mod provider;
pub mod providers;
mod receiver;
mod worker_protocol;

pub use definition::{GroupDefinition, GroupType};
pub use element::{
    ClusterMembershipElement, ClusterMembershipElementChange, ClusterMembershipElementDelta,
    GroupsMembership, GroupsMembershipChange, GroupsMembershipDelta, NodeMembership,
    NodeMembershipChange, NodeMembershipDelta, WorkerToCoreMembership,
    WorkerToCoreMembershipChange, WorkerToCoreMembershipDelta,
};
pub use filter::NodeFilter;
pub use manager::{ApplyOutcome, ClusterMembershipListener, ClusterMembershipManager};
pub use mapping::{
    DefaultGroupMappingStrategy, EvictionPolicy, GroupMapping, GroupMappingStrategy, MappingInput,
};
pub use membership::{
    ClusterMembership, ClusterMembershipChange, ClusterMembershipDelta, DomainMembership,
    DomainMembershipChange, DomainMembershipDelta,
};
pub use protocol::CoreClusterMembershipProtocol;
pub use provider::{ClusterMembershipProvider, DeltaContext, ElementDelta};
pub use providers::{
    GroupsMembershipProvider, NodeMembershipProvider, WorkerToCoreMembershipProvider,
};
pub use receiver::ClusterMembershipReceiver;
pub use worker_protocol::WorkerClusterMembershipProtocol;
