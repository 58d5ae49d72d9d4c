//! Exponential backoff for retried network calls.
//!
//! Used for notification delivery and for previous-session OHLC fetches.
//!
//! ## Example
//!
//! ```rust
//! use cpr_core::RetryPolicy;
//!
//! let policy = RetryPolicy::new(1_000, 30_000, 3).without_jitter();
//! assert_eq!(policy.calculate_delay(1), 1_000);
//! assert_eq!(policy.calculate_delay(2), 2_000);
//! assert!(policy.should_retry(3));
//! assert!(!policy.should_retry(4));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters.
///
/// Defaults:
/// - Initial delay: 1 second
/// - Maximum delay: 30 seconds
/// - Maximum retries: 3
/// - Jitter: 0-25% of the capped delay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    jitter_enabled: bool,
}

impl RetryPolicy {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            max_retries,
            jitter_enabled: true,
        }
    }

    /// Disable jitter (deterministic delays for tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry `attempt` (1-based), doubling each time and capped
    /// at `max_delay_ms` before jitter is added.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let backoff_power = attempt.saturating_sub(1).min(8);
        let exponential = self.initial_delay_ms.saturating_mul(1 << backoff_power);
        let capped = exponential.min(self.max_delay_ms);

        if self.jitter_enabled && capped > 0 {
            let jitter = (capped as f64 * rand::thread_rng().gen::<f64>() * 0.25) as u64;
            capped + jitter
        } else {
            capped
        }
    }

    pub fn calculate_delay_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt))
    }

    /// Whether retry `attempt` (1-based) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Total attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 3,
            jitter_enabled: true,
        }
    }
}
