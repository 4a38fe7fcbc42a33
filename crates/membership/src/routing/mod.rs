//! Routing of group traffic on worker nodes

mod router;

pub use router::{GroupRouter, GroupSubstack, GroupSubstackFactory, RouteOutcome};
