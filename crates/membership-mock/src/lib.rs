//! In-memory collaborators of the membership stacks, for tests.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod cleanup;
mod clock;
mod failure_detector;
mod flush;
mod live_nodes;
mod network;
mod store;
mod substack;

pub use cleanup::MockCleanupPolicy;
pub use clock::ManualClock;
pub use failure_detector::MockFailureDetector;
pub use flush::ImmediateFlushCoordinator;
pub use live_nodes::MockLiveNodeProvider;
pub use network::{MemoryNetwork, NetworkSender, RecordingSender};
pub use store::MemoryStateTransferStore;
pub use substack::{RecordingSubstackFactory, SubstackEvent};
