//! Market data collection for the CPR alert bot.
//!
//! ## Architecture
//!
//! - `provider` - The `MarketDataProvider` seam every data source implements
//! - `fyers` - Fyers REST adapter (quotes and daily history)
//! - `rate_limit` - Token bucket with a sliding 60-second call log
//! - `poller` - Round-robin price polling within the request budget

pub mod error;
pub mod fyers;
pub mod poller;
pub mod provider;
pub mod rate_limit;

pub use error::*;
pub use fyers::{select_session_candle, FyersClient, FyersCredentials};
pub use poller::*;
pub use provider::*;
pub use rate_limit::*;
