//! Run statistics.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the lifetime of the process.
#[derive(Debug)]
pub struct RunStats {
    samples: AtomicU64,
    poll_failures: AtomicU64,
    touches: AtomicU64,
    resets: AtomicU64,
    started_at: DateTime<Utc>,
}

impl RunStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            samples: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            touches: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            started_at,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_touch(&self) {
        self.touches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self, now: DateTime<Utc>) -> StatsSummary {
        StatsSummary {
            samples: self.samples.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            touches: self.touches.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSummary {
    pub samples: u64,
    pub poll_failures: u64,
    /// Samples that touched at least one level
    pub touches: u64,
    pub resets: u64,
    pub uptime_secs: u64,
}
