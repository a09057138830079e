//! Deadline-based timer state.
//!
//! The host event loop sleeps until the earliest deadline across all
//! channels and key exchanges, then drives each component's `poll_timers`.
//! Components never block; they just record deadlines here.

use std::time::{Duration, Instant};

/// One re-armable timer with exponential backoff support.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    pub(crate) deadline: Option<Instant>,
    pub(crate) interval: Duration,
}

impl Timer {
    pub(crate) fn start(&mut self, now: Instant, interval: Duration) {
        self.interval = interval;
        self.deadline = Some(now + interval);
    }

    /// Re-arm with doubled interval, capped.
    pub(crate) fn restart_backoff(&mut self, now: Instant, cap: Duration) {
        self.interval = (self.interval * 2).min(cap);
        self.deadline = Some(now + self.interval);
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}
