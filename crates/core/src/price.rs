//! Price observations.

use crate::InstrumentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last traded price of one instrument at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub instrument: InstrumentId,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
    /// Previous session close reported alongside the quote, when available
    pub prev_close: Option<f64>,
}

impl PriceSample {
    pub fn new(instrument: InstrumentId, price: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            instrument,
            price,
            observed_at,
            prev_close: None,
        }
    }

    pub fn with_prev_close(mut self, prev_close: f64) -> Self {
        self.prev_close = Some(prev_close);
        self
    }

    /// A usable price: finite and strictly positive.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }

    /// Percent change against the previous close.
    pub fn change_pct(&self) -> Option<f64> {
        self.prev_close
            .filter(|c| *c > 0.0)
            .map(|c| (self.price - c) / c * 100.0)
    }
}
