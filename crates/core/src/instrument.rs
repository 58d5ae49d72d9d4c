//! Watched instrument definitions.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker symbol identifying an instrument (e.g., "NSE:RELIANCE-EQ").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(CompactString);

impl InstrumentId {
    pub fn new(symbol: &str) -> Self {
        Self(CompactString::new(symbol.trim()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Exchange prefix of the symbol ("NSE" for "NSE:RELIANCE-EQ").
    pub fn exchange(&self) -> Option<&str> {
        self.0.split_once(':').map(|(exchange, _)| exchange)
    }

    /// Symbol without the exchange prefix or segment suffix ("RELIANCE").
    pub fn ticker(&self) -> &str {
        let symbol = self
            .0
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(self.0.as_str());
        symbol
            .strip_suffix("-EQ")
            .or_else(|| symbol.strip_suffix("-INDEX"))
            .unwrap_or(symbol)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InstrumentId {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

/// An instrument on the watch-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Broker symbol
    #[serde(rename = "symbol")]
    pub id: InstrumentId,
    /// Display name used in notifications
    pub name: String,
    /// Polling priority; higher tiers are polled first in every cycle
    #[serde(default = "default_tier")]
    pub tier: u8,
}

fn default_tier() -> u8 {
    1
}

impl Instrument {
    pub fn new(symbol: &str, name: impl Into<String>) -> Self {
        Self {
            id: InstrumentId::new(symbol),
            name: name.into(),
            tier: default_tier(),
        }
    }

    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tier = tier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_id_parts() {
        let id = InstrumentId::new("NSE:RELIANCE-EQ");
        assert_eq!(id.exchange(), Some("NSE"));
        assert_eq!(id.ticker(), "RELIANCE");

        let index = InstrumentId::new("NSE:NIFTY50-INDEX");
        assert_eq!(index.ticker(), "NIFTY50");

        let bare = InstrumentId::new("TCS");
        assert_eq!(bare.exchange(), None);
        assert_eq!(bare.ticker(), "TCS");
    }

    #[test]
    fn test_instrument_id_trims_whitespace() {
        assert_eq!(InstrumentId::new("  NSE:SBIN-EQ ").as_str(), "NSE:SBIN-EQ");
    }

    #[test]
    fn test_instrument_deserialize_default_tier() {
        let json = r#"{"symbol":"NSE:TCS-EQ","name":"TCS"}"#;
        let instrument: Instrument = serde_json::from_str(json).unwrap();
        assert_eq!(instrument.id.as_str(), "NSE:TCS-EQ");
        assert_eq!(instrument.tier, 1);
    }
}
