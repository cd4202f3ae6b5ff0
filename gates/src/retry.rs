//! Backoff schedule for transient upstream failures (timeouts, rate limits).
//!
//! | retry | delay                                              |
//! |-------|----------------------------------------------------|
//! | 0     | none (first attempt)                               |
//! | n ≥ 1 | `initial_backoff_ms × multiplier^(n-1)`, capped    |

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times a failed model call is re-sent, and how long to wait.
///
/// `max_retries` excludes the first attempt: a call makes at most
/// `max_retries + 1` attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Growth factor between consecutive retries; 1.0 means a fixed delay.
    pub backoff_multiplier: f64,
    /// Ceiling for any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `retries_made` counts retries already sent, not attempts.
    pub fn should_retry(&self, retries_made: u32) -> bool {
        retries_made < self.max_retries
    }

    /// Delay in ms before retry number `retry` (1-based); 0 for `retry == 0`.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        let Some(exponent) = retry.checked_sub(1) else {
            return 0;
        };
        let cap = self.max_backoff_ms as f64;
        let grown = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32)
            * self.initial_backoff_ms as f64;
        // powi overflows to infinity for long schedules; the cap still holds.
        if grown.is_nan() || grown >= cap {
            self.max_backoff_ms
        } else {
            grown as u64
        }
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "max_backoff_ms ({}) must be >= initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        Ok(())
    }
}
