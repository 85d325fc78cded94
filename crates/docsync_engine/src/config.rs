//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Maximum number of mutation batches written to the stream before
    /// their acks arrive.
    pub max_writes_in_flight: usize,
    /// Whether views are written back to persistence after each transition.
    pub persist_views: bool,
    /// Capacity of the client's command queue.
    pub command_buffer: usize,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_writes_in_flight: 10,
            persist_views: true,
            command_buffer: 256,
        }
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the in-flight write limit.
    pub fn with_max_writes_in_flight(mut self, limit: usize) -> Self {
        self.max_writes_in_flight = limit.max(1);
        self
    }

    /// Enables or disables view persistence.
    pub fn with_persist_views(mut self, persist: bool) -> Self {
        self.persist_views = persist;
        self
    }

    /// Sets the command queue capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect backoff curve.
///
/// The delay starts at `initial_delay`, grows by `multiplier` per failed
/// attempt up to `max_delay`, and resets once a connection has stayed
/// healthy for `reset_after`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay; `0.0` disables it.
    pub jitter: f64,
    /// Healthy period after which the backoff resets.
    pub reset_after: Duration,
}

impl BackoffConfig {
    /// Creates a backoff curve.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 1.5,
            jitter: 0.5,
            reset_after: Duration::from_secs(60),
        }
    }

    /// A curve without any delay, used by tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            reset_after: Duration::ZERO,
        }
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Sets the healthy period after which the backoff resets.
    pub fn with_reset_after(mut self, period: Duration) -> Self {
        self.reset_after = period;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    ///
    /// Attempt 0 connects immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            Duration::from_secs_f64((capped + offset).max(0.0))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
