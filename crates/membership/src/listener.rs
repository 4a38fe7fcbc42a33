//! Listener registration and isolated dispatch
//!
//! Public listener sets are copy-on-write snapshots swapped atomically, so
//! dispatch on the compartment never blocks against concurrent
//! registration from other threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::error;

use crate::error::{MembershipError, MembershipResult};

/// Error returned by a membership listener callback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Abort the whole dispatch and propagate to the caller
    #[error("interrupted")]
    Interrupted,

    /// The listener failed; logged and isolated from other listeners
    #[error("listener failed: {0}")]
    Failed(String),
}

/// Result type of listener callbacks
pub type ListenerResult = Result<(), ListenerError>;

/// Copy-on-write listener registry
pub struct ListenerRegistry<L: ?Sized> {
    listeners: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register a listener
    pub fn add(&self, listener: Arc<L>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
    }

    /// Remove a previously registered listener (compared by pointer)
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<Arc<L>> = current
                .iter()
                .filter(|existing| !Arc::ptr_eq(existing, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Current snapshot of listeners
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.listeners.load_full()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke `callback` on every listener in order.
///
/// A failing or panicking listener is logged and skipped. An interruption
/// stops dispatch and is returned to the caller.
pub(crate) fn dispatch<L: ?Sized>(
    event: &str,
    listeners: &[Arc<L>],
    mut callback: impl FnMut(&L) -> ListenerResult,
) -> MembershipResult<()> {
    for (index, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(ListenerError::Interrupted)) => return Err(MembershipError::Interrupted),
            Ok(Err(ListenerError::Failed(reason))) => {
                error!("Listener {} failed handling {}: {}", index, event, reason);
            }
            Err(_) => {
                error!("Listener {} panicked handling {}", index, event);
            }
        }
    }

    Ok(())
}
