//! Configuration for the sync engine.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How conflicting operations are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Run the transformer and apply the result.
    #[default]
    Automatic,
    /// Park conflicts until a user picks a side.
    Manual,
}

/// Configuration for a sync session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of resolved operations kept per document for conflict detection.
    pub history_limit: usize,
    /// Retry policy for delivering a single operation.
    pub delivery: RetryConfig,
    /// Retry policy for re-establishing the session after the network returns.
    pub reconnect: RetryConfig,
    /// Upper bound on one delivery attempt, in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Interval between periodic queue processing runs, in milliseconds.
    pub process_interval_ms: u64,
    /// Conflict policy.
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            delivery: RetryConfig::new(3),
            reconnect: RetryConfig::new(5)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            delivery_timeout_ms: 10_000,
            process_interval_ms: 5_000,
            conflict_policy: ConflictPolicy::Automatic,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON; missing keys take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the history limit.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the delivery retry policy.
    pub fn with_delivery_retry(mut self, retry: RetryConfig) -> Self {
        self.delivery = retry;
        self
    }

    /// Sets the reconnect retry policy.
    pub fn with_reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    /// Sets the delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the periodic processing interval.
    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Delivery timeout as a duration.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Processing interval as a duration.
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

/// Configuration for retry behavior with capped exponential backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0 means the first try).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.initial_delay_ms as f64
            * self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay_ms = base_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
