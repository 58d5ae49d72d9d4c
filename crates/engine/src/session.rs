//! Market session schedule.
//!
//! Exchange-local time is derived from a fixed UTC offset (the exchanges
//! watched here do not observe daylight saving).

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use cpr_core::{is_trading_day, previous_trading_day};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid UTC offset: {0} minutes")]
    InvalidOffset(i32),

    #[error("Market open {open} must be before close {close}")]
    OpenAfterClose { open: NaiveTime, close: NaiveTime },

    #[error("Level reset {reset_at} must be before market open {open}")]
    ResetAfterOpen { reset_at: NaiveTime, open: NaiveTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Trading day, before the open
    PreMarket,
    /// Open for trading: `open <= t < close`
    Open,
    /// After the close, weekends
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::PreMarket => "pre-market",
            SessionPhase::Open => "open",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSchedule {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    /// Local time of the daily level reset
    reset_at: NaiveTime,
}

impl SessionSchedule {
    pub fn new(
        utc_offset_minutes: i32,
        open: NaiveTime,
        close: NaiveTime,
        reset_at: NaiveTime,
    ) -> Result<Self, ScheduleError> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or(ScheduleError::InvalidOffset(utc_offset_minutes))?;
        if open >= close {
            return Err(ScheduleError::OpenAfterClose { open, close });
        }
        // Polling must never start on the previous day's levels
        if reset_at >= open {
            return Err(ScheduleError::ResetAfterOpen { reset_at, open });
        }
        Ok(Self {
            offset,
            open,
            close,
            reset_at,
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn open_time(&self) -> NaiveTime {
        self.open
    }

    pub fn close_time(&self) -> NaiveTime {
        self.close
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    /// Exchange-local calendar date.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> SessionPhase {
        let local = self.local(now);
        if !is_trading_day(local.date_naive()) {
            return SessionPhase::Closed;
        }

        let time = local.time();
        if time < self.open {
            SessionPhase::PreMarket
        } else if time < self.close {
            SessionPhase::Open
        } else {
            SessionPhase::Closed
        }
    }

    /// Trading date whose reset is due, if any.
    ///
    /// A reset is due on a trading day once the local reset time has passed
    /// and no reset has run for that date yet, which also covers starting the
    /// process after the reset time.
    pub fn reset_due(&self, now: DateTime<Utc>, last_reset: Option<NaiveDate>) -> Option<NaiveDate> {
        let local = self.local(now);
        let today = local.date_naive();
        let due = is_trading_day(today) && local.time() >= self.reset_at && last_reset != Some(today);
        due.then_some(today)
    }

    /// Session whose candle levels for `trading_date` are computed from.
    pub fn source_session(&self, trading_date: NaiveDate) -> NaiveDate {
        previous_trading_day(trading_date)
    }

    /// Next time the market opens strictly after `now`.
    pub fn next_open_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.local(now);
        let mut date = local.date_naive();
        if local.time() >= self.open {
            date = date.succ_opt().unwrap_or(date);
        }
        while !is_trading_day(date) {
            date = date.succ_opt().unwrap_or(date);
        }
        self.to_utc(date, self.open)
    }

    /// Time left until the close, zero outside the open phase.
    pub fn time_until_close(&self, now: DateTime<Utc>) -> Duration {
        if self.phase_at(now) != SessionPhase::Open {
            return Duration::zero();
        }
        self.to_utc(self.local_date(now), self.close) - now
    }

    fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        // Fixed offsets map every local time to exactly one instant
        match self.offset.from_local_datetime(&naive).single() {
            Some(local) => local.with_timezone(&Utc),
            None => {
                Utc.from_utc_datetime(&naive)
                    - Duration::seconds(i64::from(self.offset.local_minus_utc()))
            }
        }
    }
}
