//! Time source used by all periodic protocol logic

use std::time::Instant;

/// Supplies the current time in milliseconds.
///
/// Only differences between readings are meaningful.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Monotonic clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Gate that opens once per period.
#[derive(Debug, Clone)]
pub(crate) struct PeriodGate {
    period_ms: u64,
    last_ms: Option<u64>,
}

impl PeriodGate {
    pub(crate) fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: None,
        }
    }

    /// Returns true (and re-arms) if a full period elapsed since the last opening.
    pub(crate) fn try_pass(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms.saturating_sub(last) < self.period_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_ms = None;
    }
}
