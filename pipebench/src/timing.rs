//! One-shot timer for bounding the benchmark run.

use std::time::{Duration, Instant};

/// A one-shot deadline timer.
///
/// The bench loop polls [`OneshotTimer::fire`] each iteration; expiry is
/// reported exactly once.
#[derive(Debug, Default)]
pub struct OneshotTimer {
    deadline: Option<Instant>,
}

impl OneshotTimer {
    /// Create an unarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `after` from now. Re-arming replaces any
    /// previous deadline.
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true exactly once, on the first poll at or past the deadline.
    pub fn fire(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
