//! Request budget enforcement for provider calls.
//!
//! A continuous-refill token bucket smooths calls out to `budget` per minute.
//! The bucket alone would allow a full burst plus a minute of refill inside
//! one 60-second window, so a sliding log of call times caps every window at
//! `budget` calls.
//!
//! ## Example
//!
//! ```rust
//! use cpr_feeds::{RateLimitConfig, RateLimiter};
//! use std::time::Instant;
//!
//! let mut limiter = RateLimiter::new(RateLimitConfig::new(10, 1));
//! let now = Instant::now();
//! assert!(limiter.try_acquire_at(now));
//! assert!(!limiter.try_acquire_at(now));
//! assert!(limiter.wait_time_at(now) > std::time::Duration::ZERO);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

/// Length of the budget window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Slack for float error in the refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Budget of provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum calls in any 60-second window
    pub calls_per_minute: u32,
    /// Tokens that may accumulate while idle
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn new(calls_per_minute: u32, burst: u32) -> Self {
        Self {
            calls_per_minute: calls_per_minute.max(1),
            burst: burst.clamp(1, calls_per_minute.max(1)),
        }
    }

    /// Steady-state spacing between calls.
    pub fn interval(&self) -> Duration {
        RATE_WINDOW / self.calls_per_minute
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(10, 1)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Tokens available
    tokens: f64,
    /// Last time tokens were updated
    last_refill: Option<Instant>,
    /// Times of calls inside the current window, oldest first
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            last_refill: None,
            calls: VecDeque::with_capacity(config.calls_per_minute as usize),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.config.calls_per_minute as f64 / RATE_WINDOW.as_secs_f64()
    }

    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens =
                (self.tokens + elapsed * self.refill_rate_per_sec()).min(self.config.burst as f64);
        }
        self.last_refill = Some(match self.last_refill {
            Some(last) if last > now => last,
            _ => now,
        });
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take a token if both the bucket and the window allow it.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.prune(now);

        let window_full = self.calls.len() >= self.config.calls_per_minute as usize;
        if window_full || self.tokens + TOKEN_EPSILON < 1.0 {
            return false;
        }

        self.tokens = (self.tokens - 1.0).max(0.0);
        self.calls.push_back(now);
        true
    }

    /// Time until `try_acquire_at` would succeed.
    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.prune(now);

        let token_wait = if self.tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate_per_sec())
        };

        let window_wait = if self.calls.len() >= self.config.calls_per_minute as usize {
            self.calls
                .front()
                .map(|oldest| (*oldest + RATE_WINDOW).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        token_wait.max(window_wait)
    }

    /// Calls made inside the window ending at `now`.
    pub fn calls_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.calls.len()
    }

    /// Wait until a token is available and take it.
    ///
    /// Uses the tokio clock so paused-time tests advance deterministically.
    pub async fn acquire(&mut self) {
        loop {
            let now = tokio::time::Instant::now().into_std();
            if self.try_acquire_at(now) {
                return;
            }
            let wait = self.wait_time_at(now).max(Duration::from_millis(1));
            trace!(wait_ms = wait.as_millis() as u64, "Waiting for request budget");
            tokio::time::sleep(wait).await;
        }
    }
}
