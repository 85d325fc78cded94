//! Reconnect backoff state.

use crate::config::BackoffConfig;
use std::time::{Duration, Instant};

/// Tracks consecutive failed connection attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
    healthy_since: Option<Instant>,
}

impl ExponentialBackoff {
    /// Creates a backoff with no recorded failures.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            healthy_since: None,
        }
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next connection attempt.
    pub fn current_delay(&self) -> Duration {
        self.config.delay_for_attempt(self.attempt)
    }

    /// Records that a connection opened at `now`.
    pub fn record_open(&mut self, now: Instant) {
        self.healthy_since = Some(now);
    }

    /// Records a connection failure at `now` and returns the delay before
    /// reconnecting.
    ///
    /// A connection that stayed healthy for the configured period resets
    /// the curve before the failure is counted.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        if let Some(since) = self.healthy_since.take() {
            if now.saturating_duration_since(since) >= self.config.reset_after {
                self.attempt = 0;
            }
        }
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay()
    }

    /// Forgets all recorded failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.healthy_since = None;
    }
}
