//! Round-local wall clock and send-loop deadline monitor.
//!
//! The main loop measures everything as a [`Duration`] since a round-local
//! origin that is reset on every new round. Built on [`tokio::time::Instant`]
//! so tests can virtualize time through tokio's paused clock.

use std::time::Duration;
use tokio::time::Instant;

/// A wall clock with a movable origin.
#[derive(Clone, Debug)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Reset the origin to now. Called on every new round.
    pub fn zero(&mut self) {
        self.origin = Instant::now();
    }

    /// Elapsed time since the origin.
    pub fn since(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Absolute instant corresponding to `offset` past the origin.
    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }

    /// A deadline monitor expiring at `offset` past the origin.
    pub fn deadline_monitor_at(&self, offset: Duration) -> DeadlineMonitor {
        DeadlineMonitor {
            deadline: self.instant_at(offset),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap repeated-poll deadline check used by the send loop.
#[derive(Clone, Copy, Debug)]
pub struct DeadlineMonitor {
    deadline: Instant,
}

impl DeadlineMonitor {
    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
