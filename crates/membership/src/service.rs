//! Async driver running a protocol stack on its own compartment

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{MembershipError, MembershipResult};
use crate::message::Message;
use crate::stack::ProtocolStack;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

enum ServiceState<S> {
    Idle(S),
    Running {
        task: JoinHandle<S>,
        shutdown_signal: oneshot::Sender<()>,
    },
    Stopped(Option<S>),
}

/// Drives a [`ProtocolStack`] from a single tokio task.
///
/// Timer ticks and inbound messages are serialized on that task, so the
/// stack itself needs no locking. Inbound messages are queued on an
/// unbounded channel, see [`inbound_sender`](Self::inbound_sender).
pub struct MembershipService<S: ProtocolStack> {
    state: Mutex<ServiceState<S>>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    inbound_tx: flume::Sender<Message>,
    inbound_rx: flume::Receiver<Message>,
}

impl<S: ProtocolStack> MembershipService<S> {
    /// Create a service; nothing runs until [`start`](Self::start)
    pub fn new(stack: S, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Self {
            state: Mutex::new(ServiceState::Idle(stack)),
            clock,
            tick_interval,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Bound the wait for the driver task on shutdown (5 s by default)
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sender feeding inbound messages to the stack
    pub fn inbound_sender(&self) -> flume::Sender<Message> {
        self.inbound_tx.clone()
    }

    /// Queue an inbound message
    pub fn deliver(&self, message: Message) -> MembershipResult<()> {
        self.inbound_tx
            .send(message)
            .map_err(|e| MembershipError::Channel(e.to_string()))
    }

    /// Whether the driver task is running
    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ServiceState::Running { .. })
    }

    /// Spawn the driver task
    pub async fn start(&self) -> MembershipResult<()> {
        let mut state = self.state.lock().await;
        let stack = match std::mem::replace(&mut *state, ServiceState::Stopped(None)) {
            ServiceState::Idle(stack) => stack,
            other => {
                *state = other;
                return Err(MembershipError::Service(
                    "membership service already started".to_string(),
                ));
            }
        };

        info!("Starting membership service for {}", stack.local_node());

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let inbound = self.inbound_rx.clone();
        let clock = self.clock.clone();
        let tick_interval = self.tick_interval;

        let task = tokio::spawn(async move {
            let mut stack = stack;
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = stack.on_timer(clock.now_ms()) {
                            error!("Membership timer failed: {}", e);
                        }
                    }
                    received = inbound.recv_async() => {
                        match received {
                            Ok(message) => {
                                if let Err(e) = stack.receive(message, clock.now_ms()) {
                                    warn!("Failed to handle inbound message: {}", e);
                                }
                            }
                            Err(_) => {
                                debug!("Inbound channel closed");
                                break;
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Membership service task received shutdown signal");
                        break;
                    }
                }
            }

            stack.stop();
            debug!("Membership service task exiting");
            stack
        });

        *state = ServiceState::Running {
            task,
            shutdown_signal: shutdown_tx,
        };
        Ok(())
    }

    /// Stop the driver task and wait for it to exit.
    ///
    /// A task that does not stop within the shutdown timeout is aborted and
    /// its stack is lost.
    pub async fn shutdown(&self) -> MembershipResult<()> {
        let mut state = self.state.lock().await;
        let (task, shutdown_signal) = match std::mem::replace(&mut *state, ServiceState::Stopped(None)) {
            ServiceState::Running {
                task,
                shutdown_signal,
            } => (task, shutdown_signal),
            ServiceState::Idle(stack) => {
                *state = ServiceState::Stopped(Some(stack));
                return Ok(());
            }
            stopped @ ServiceState::Stopped(_) => {
                *state = stopped;
                return Ok(());
            }
        };

        info!("Shutting down membership service");
        let _ = shutdown_signal.send(());

        let abort_handle = task.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(stack)) => {
                debug!("Membership service task shut down cleanly");
                *state = ServiceState::Stopped(Some(stack));
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Membership service task panicked: {}", e);
                Err(MembershipError::Service(format!(
                    "membership service task failed: {e}"
                )))
            }
            Err(_) => {
                error!("Membership service task did not shut down within timeout, aborting");
                abort_handle.abort();
                Err(MembershipError::Service(format!(
                    "membership service task did not stop within {:?}",
                    self.shutdown_timeout
                )))
            }
        }
    }

    /// Take back the stack once the service is stopped or was never started
    pub async fn take_stack(&self) -> Option<S> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ServiceState::Stopped(None)) {
            ServiceState::Idle(stack) | ServiceState::Stopped(Some(stack)) => Some(stack),
            other => {
                *state = other;
                None
            }
        }
    }
}
