//! Touch events and alert records.

use crate::{InstrumentId, LevelKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of the price relative to a level's tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Above,
    Below,
    InsideBand,
    /// No sample observed since the levels were loaded
    #[default]
    Unknown,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Above => "above",
            Side::Below => "below",
            Side::InsideBand => "inside_band",
            Side::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price entered a level's band from a directionally valid side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
    pub instrument: InstrumentId,
    pub level: LevelKind,
    pub level_value: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub from_side: Side,
}

impl TouchEvent {
    /// Signed distance from the level in percent.
    pub fn distance_pct(&self) -> f64 {
        if self.level_value == 0.0 {
            return 0.0;
        }
        (self.price - self.level_value) / self.level_value * 100.0
    }

    pub fn to_record(&self) -> AlertRecord {
        AlertRecord {
            instrument: self.instrument.clone(),
            level: self.level,
            level_value: self.level_value,
            price: self.price,
            timestamp: self.timestamp,
        }
    }
}

/// Durable record of an alert that cleared cooldown. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub instrument: InstrumentId,
    pub level: LevelKind,
    pub level_value: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A touch that cleared cooldown, with the context shown in the notification.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchAlert {
    pub event: TouchEvent,
    /// Display name of the instrument
    pub name: String,
    /// Running touch count of this level for the day
    pub touch_number: u32,
    /// Other levels touched by the same sample or while suppressed
    pub also_touched: Vec<LevelKind>,
}

impl TouchAlert {
    pub fn new(event: TouchEvent, name: impl Into<String>) -> Self {
        Self {
            event,
            name: name.into(),
            touch_number: 1,
            also_touched: Vec::new(),
        }
    }
}
