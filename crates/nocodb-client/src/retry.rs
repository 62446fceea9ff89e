//! Retry policy and backoff math.
//!
//! A [`RetryPolicy`] is plain configuration: how many attempts a request may
//! make, how long to wait between them, and which HTTP statuses are worth
//! another try. The executor consumes it; nothing here performs I/O.

use crate::error::{ClientError, Result};
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;

/// Jitter applied to every backoff delay (±10%).
pub const JITTER_FACTOR: f64 = 0.1;

/// HTTP statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Retry configuration for one request (or for every request of a client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (default: 3)
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further attempt (default: 100ms)
    pub base_delay: Duration,
    /// Upper bound for a single delay (default: 10 seconds)
    pub max_delay: Duration,
    /// Wall-clock budget for the whole retry sequence (default: 30 seconds)
    pub max_total_delay: Duration,
    /// Statuses considered transient (default: 408, 429, 500, 502, 503, 504)
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_total_delay: Duration::from_secs(30),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the per-delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the total wall-clock budget for retries.
    pub fn with_max_total_delay(mut self, delay: Duration) -> Self {
        self.max_total_delay = delay;
        self
    }

    /// Replace the set of retryable statuses.
    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Returns true if a response with this status may be retried.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Un-jittered delay before the retry following `attempt` (zero-based):
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the retry following `attempt`, jittered uniformly by ±10%.
    ///
    /// A jittered value that does not fit in a `Duration` falls back to the
    /// nominal delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        Duration::try_from_secs_f64(nominal.as_secs_f64() * (1.0 + jitter)).unwrap_or(nominal)
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(ClientError::Config(
                "max_retries must be >= 1 (it counts the first attempt)".to_string(),
            ));
        }

        if self.base_delay > self.max_delay {
            return Err(ClientError::Config(format!(
                "base_delay ({:?}) must be <= max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        Ok(())
    }
}
