//! Group model, the group membership manager and its coordinator loop

mod manager;
mod membership;
mod primary;
mod tracker;
mod types;

pub use manager::{
    GroupMembershipListener, GroupMembershipManager, LeaveReason, PreparedGroupMembershipListener,
};
pub use membership::{GroupMembership, GroupMembershipChange, GroupMembershipDelta};
pub use primary::is_primary_partition;
pub use tracker::{GroupMembershipTracker, TrackDecision};
pub use types::{
    CORE_GROUP_ID, CORE_GROUP_NAME, Group, GroupAddress, GroupChange, GroupDelta, GroupOption,
};
