//! Central Pivot Range level calculation.
//!
//! Levels are derived from the previous session's high/low/close and kept at
//! full floating-point precision. Rounding is a presentation concern only.

use crate::InstrumentId;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from level computation. All of them mean "skip this instrument
/// for the session".
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LevelError {
    #[error("No previous session OHLC available for {0}")]
    InsufficientData(InstrumentId),

    #[error("Invalid OHLC for {instrument}: {reason}")]
    InvalidOhlc {
        instrument: InstrumentId,
        reason: String,
    },

    #[error("Degenerate OHLC for {0}: high equals low")]
    Degenerate(InstrumentId),
}

/// Where the OHLC values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OhlcSource {
    /// Daily candle from the history endpoint
    #[default]
    Historical,
    /// Estimated from the previous close in a quote (±1%)
    QuotesEstimate,
}

impl OhlcSource {
    pub fn as_str(self) -> &'static str {
        match self {
            OhlcSource::Historical => "historical",
            OhlcSource::QuotesEstimate => "quotes_estimate",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "quotes_estimate" => OhlcSource::QuotesEstimate,
            _ => OhlcSource::Historical,
        }
    }
}

/// Daily open/high/low/close of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Session date the candle belongs to
    pub date: NaiveDate,
    pub volume: Option<u64>,
    #[serde(default)]
    pub source: OhlcSource,
}

impl Ohlc {
    pub fn new(open: f64, high: f64, low: f64, close: f64, date: NaiveDate) -> Self {
        Self {
            open,
            high,
            low,
            close,
            date,
            volume: None,
            source: OhlcSource::Historical,
        }
    }

    /// Build an estimated candle around a previous close.
    pub fn estimate_from_close(prev_close: f64, date: NaiveDate) -> Self {
        Self {
            open: prev_close,
            high: prev_close * 1.01,
            low: prev_close * 0.99,
            close: prev_close,
            date,
            volume: None,
            source: OhlcSource::QuotesEstimate,
        }
    }

    fn validate(&self, instrument: &InstrumentId) -> Result<(), LevelError> {
        let invalid = |reason: &str| LevelError::InvalidOhlc {
            instrument: instrument.clone(),
            reason: reason.to_string(),
        };

        let values = [self.open, self.high, self.low, self.close];
        if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(invalid("prices must be finite and positive"));
        }
        if self.high < self.low {
            return Err(invalid("high below low"));
        }
        if self.close < self.low || self.close > self.high {
            return Err(invalid("close outside high/low range"));
        }
        if self.high == self.low {
            return Err(LevelError::Degenerate(instrument.clone()));
        }
        Ok(())
    }
}

/// Levels that are tracked for touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelKind {
    S1,
    Pivot,
    R1,
}

impl LevelKind {
    pub const ALL: [LevelKind; 3] = [LevelKind::S1, LevelKind::Pivot, LevelKind::R1];

    pub fn as_str(self) -> &'static str {
        match self {
            LevelKind::S1 => "S1",
            LevelKind::Pivot => "PIVOT",
            LevelKind::R1 => "R1",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "S1" => Some(LevelKind::S1),
            "PIVOT" | "P" => Some(LevelKind::Pivot),
            "R1" => Some(LevelKind::R1),
            _ => None,
        }
    }

    /// Alert priority when several levels are touched by the same sample.
    pub fn priority(self) -> u8 {
        match self {
            LevelKind::R1 => 3,
            LevelKind::S1 => 2,
            LevelKind::Pivot => 1,
        }
    }

    /// Whether this is a major support/resistance level.
    pub fn is_key_level(self) -> bool {
        matches!(self, LevelKind::S1 | LevelKind::R1)
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pivot, central range and first support/resistance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CprLevels {
    pub pivot: f64,
    /// Top central
    pub tc: f64,
    /// Bottom central
    pub bc: f64,
    pub r1: f64,
    pub s1: f64,
}

impl CprLevels {
    /// Apply the CPR formulas to a session candle.
    pub fn from_ohlc(ohlc: &Ohlc) -> Self {
        let pivot = (ohlc.high + ohlc.low + ohlc.close) / 3.0;
        let bc = (ohlc.high + ohlc.low) / 2.0;
        let tc = (pivot - bc) + pivot;
        let r1 = 2.0 * pivot - ohlc.low;
        let s1 = 2.0 * pivot - ohlc.high;

        Self { pivot, tc, bc, r1, s1 }
    }

    pub fn get(&self, kind: LevelKind) -> f64 {
        match kind {
            LevelKind::S1 => self.s1,
            LevelKind::Pivot => self.pivot,
            LevelKind::R1 => self.r1,
        }
    }
}

/// Levels for one instrument and trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLevels {
    pub instrument: InstrumentId,
    /// Day the levels are used for
    pub trading_date: NaiveDate,
    pub levels: CprLevels,
    /// Session the levels were computed from
    pub source: Ohlc,
}

impl SessionLevels {
    /// Compute levels for `trading_date` from the previous session candle.
    ///
    /// `None` means the provider had no data (first run, holiday lookup miss);
    /// the caller must skip the instrument rather than emit degenerate levels.
    pub fn compute(
        instrument: InstrumentId,
        trading_date: NaiveDate,
        previous_session: Option<Ohlc>,
    ) -> Result<Self, LevelError> {
        let source = previous_session.ok_or_else(|| LevelError::InsufficientData(instrument.clone()))?;
        source.validate(&instrument)?;

        Ok(Self {
            levels: CprLevels::from_ohlc(&source),
            instrument,
            trading_date,
            source,
        })
    }

    #[inline]
    pub fn level(&self, kind: LevelKind) -> f64 {
        self.levels.get(kind)
    }
}

/// Previous weekday before `date`. Exchange holidays are not known here; the
/// provider falls back to the closest earlier candle.
pub fn previous_trading_day(date: NaiveDate) -> NaiveDate {
    let back = match date.weekday() {
        Weekday::Mon => 3,
        Weekday::Sun => 2,
        _ => 1,
    };
    date - Duration::days(back)
}

/// Whether exchanges trade on this date (Monday to Friday).
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Round to two decimals for display.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
