//! Built-in cluster membership providers

mod groups;
mod node;
mod worker_to_core;

pub use groups::GroupsMembershipProvider;
pub use node::NodeMembershipProvider;
pub use worker_to_core::WorkerToCoreMembershipProvider;
