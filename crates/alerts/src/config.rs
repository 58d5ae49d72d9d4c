//! Alert configuration types.

use cpr_core::{InstrumentId, LevelKind, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a cooldown blocks once an alert has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// Any level of the instrument
    #[default]
    Instrument,
    /// Only the level that alerted
    InstrumentLevel,
}

/// Key of one cooldown window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub instrument: InstrumentId,
    /// Set only for `CooldownScope::InstrumentLevel`
    pub level: Option<LevelKind>,
}

impl CooldownScope {
    pub fn key(self, instrument: &InstrumentId, level: LevelKind) -> CooldownKey {
        CooldownKey {
            instrument: instrument.clone(),
            level: match self {
                CooldownScope::Instrument => None,
                CooldownScope::InstrumentLevel => Some(level),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Minimum time between dispatched alerts
    pub window_minutes: i64,
    pub scope: CooldownScope,
}

impl CooldownConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes)
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            scope: CooldownScope::Instrument,
        }
    }
}

/// Delivery settings for the notification channel.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Deadline for a single send
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_keys() {
        let id = InstrumentId::new("NSE:ITC-EQ");
        let per_instrument = CooldownScope::Instrument;
        assert_eq!(
            per_instrument.key(&id, LevelKind::R1),
            per_instrument.key(&id, LevelKind::S1)
        );

        let per_level = CooldownScope::InstrumentLevel;
        assert_ne!(per_level.key(&id, LevelKind::R1), per_level.key(&id, LevelKind::S1));
    }

    #[test]
    fn test_cooldown_config_default() {
        let config = CooldownConfig::default();
        assert_eq!(config.window(), chrono::Duration::minutes(30));
        assert_eq!(config.scope, CooldownScope::Instrument);
    }
}
