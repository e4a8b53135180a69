//! Reconnect backoff
//!
//! The interval grows by a fixed increment after every failure, capped at a
//! maximum, and drops back to zero after a success. The delay actually
//! waited adds the server's advised interval on top.

use std::time::Duration;

use crate::message::Advice;

/// Backoff state for reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current_interval_ms: u64,
    increment_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(increment_ms: u64, max_ms: u64) -> Self {
        Self {
            current_interval_ms: 0,
            increment_ms,
            max_ms,
        }
    }

    /// Record a failure and grow the interval
    pub fn on_failure(&mut self) -> u64 {
        self.current_interval_ms = self
            .current_interval_ms
            .saturating_add(self.increment_ms)
            .min(self.max_ms);
        self.current_interval_ms
    }

    /// Record a success and reset the interval
    pub fn on_success(&mut self) {
        self.current_interval_ms = 0;
    }

    /// Current backoff interval in milliseconds
    pub fn interval_ms(&self) -> u64 {
        self.current_interval_ms
    }

    pub fn increment_ms(&self) -> u64 {
        self.increment_ms
    }

    pub fn set_increment_ms(&mut self, increment_ms: u64) {
        self.increment_ms = increment_ms;
    }

    /// Delay before the next attempt: backoff plus the advised interval
    pub fn next_delay(&self, advice: &Advice) -> Duration {
        let advised = advice.interval.unwrap_or(0);
        Duration::from_millis(self.current_interval_ms.saturating_add(advised))
    }
}
