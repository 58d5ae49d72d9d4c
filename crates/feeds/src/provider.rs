//! Market data provider seam.

use crate::error::FeedError;
use async_trait::async_trait;
use chrono::NaiveDate;
use cpr_core::{InstrumentId, Ohlc, PriceSample};

/// Source of live prices and daily candles.
///
/// Every method performs exactly one network call, so the poller can account
/// each invocation against the request budget.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Latest quote, including the previous close when the provider reports it.
    async fn quote(&self, instrument: &InstrumentId) -> Result<PriceSample, FeedError>;

    /// Daily candle of the session on `date`, or the closest earlier one.
    /// `FeedError::NoData` when no usable candle exists.
    async fn previous_session_ohlc(
        &self,
        instrument: &InstrumentId,
        date: NaiveDate,
    ) -> Result<Ohlc, FeedError>;

    /// Last traded price of the instrument.
    async fn last_traded_price(&self, instrument: &InstrumentId) -> Result<f64, FeedError> {
        self.quote(instrument).await.map(|sample| sample.price)
    }
}
