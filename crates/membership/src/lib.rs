//! Membership middleware for a two-tier cluster
//!
//! This crate provides:
//! - Discovery of core peers, of the core coordinator and of worker nodes
//! - Agreement on the core group membership through a flush coordinator
//! - A composite cluster membership (nodes, managed groups and worker to
//!   core bindings per domain) built by pluggable providers
//! - Dissemination of that membership to core members and worker nodes
//! - Routing of group traffic to per-group substacks on workers
//!
//! Protocols are plain state machines driven by a timer and by inbound
//! messages; [`MembershipService`] runs a stack of them on a tokio task.
#![warn(missing_docs)]

pub mod clock;
pub mod cluster;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod discovery;
pub mod error;
pub mod group;
pub mod listener;
pub mod message;
pub mod node;
pub mod routing;
pub mod service;
pub mod stack;

pub use clock::{Clock, SystemClock};
pub use cluster::{
    ApplyOutcome, ClusterMembership, ClusterMembershipChange, ClusterMembershipDelta,
    ClusterMembershipListener, ClusterMembershipManager, GroupDefinition, GroupType,
};
pub use codec::PartRegistry;
pub use collaborators::{
    DiscoveryCleanupPolicy, FailureDetector, FlushCondition, FlushCoordinator, LiveNodeProvider,
    MessageSender, StateTransferStore,
};
pub use config::MembershipConfig;
pub use error::{MembershipError, MembershipResult};
pub use group::{
    Group, GroupMembership, GroupMembershipDelta, GroupMembershipListener, GroupMembershipManager,
    LeaveReason,
};
pub use listener::{ListenerError, ListenerResult};
pub use message::{Destination, Message, MessagePart};
pub use node::{Address, CORE_DOMAIN, Node, NodeId};
pub use routing::{GroupRouter, GroupSubstack, GroupSubstackFactory};
pub use service::MembershipService;
pub use stack::{CoreStack, CoreStackBuilder, ProtocolStack, WorkerStack, WorkerStackBuilder};
