//! Fyers REST market data adapter.
//!
//! Quotes come from `/data/quotes`, daily candles from `/data/history`.
//! Every request carries the `app_id:access_token` authorization header.

use crate::error::FeedError;
use crate::provider::MarketDataProvider;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use cpr_core::{InstrumentId, Ohlc, OhlcSource, PriceSample};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Days searched backwards when the exact session candle is missing.
const CANDLE_LOOKBACK_DAYS: i64 = 5;

/// API error codes that mean the token is invalid or expired.
const AUTH_ERROR_CODES: [i64; 4] = [-8, -15, -16, -17];

#[derive(Debug, Clone)]
pub struct FyersCredentials {
    pub app_id: String,
    pub access_token: String,
}

impl FyersCredentials {
    fn authorization(&self) -> String {
        format!("{}:{}", self.app_id, self.access_token)
    }
}

/// Fyers data API client.
pub struct FyersClient {
    http: reqwest::Client,
    base_url: String,
    credentials: FyersCredentials,
    /// Exchange-local offset for mapping candle timestamps to dates
    utc_offset: FixedOffset,
}

impl FyersClient {
    pub const BASE_URL: &'static str = "https://api-t1.fyers.in";

    pub fn new(
        credentials: FyersCredentials,
        request_timeout: Duration,
        utc_offset: FixedOffset,
    ) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FeedError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: Self::BASE_URL.to_string(),
            credentials,
            utc_offset,
        })
    }

    /// Point the client at another host (sandbox or test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, FeedError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.credentials.authorization())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response.json().await?;
        check_api_status(&json)?;
        Ok(json)
    }

    async fn history(
        &self,
        instrument: &InstrumentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HistoryResponse, FeedError> {
        let query = [
            ("symbol", instrument.as_str().to_string()),
            ("resolution", "D".to_string()),
            ("date_format", "1".to_string()),
            ("range_from", from.format("%Y-%m-%d").to_string()),
            ("range_to", to.format("%Y-%m-%d").to_string()),
            ("cont_flag", "1".to_string()),
        ];
        let json = self.get_json("/data/history", &query).await?;
        Ok(serde_json::from_value(json)?)
    }
}

#[async_trait]
impl MarketDataProvider for FyersClient {
    fn name(&self) -> &str {
        "fyers"
    }

    async fn quote(&self, instrument: &InstrumentId) -> Result<PriceSample, FeedError> {
        let json = self
            .get_json("/data/quotes", &[("symbols", instrument.as_str().to_string())])
            .await?;
        parse_quote(instrument, &json, Utc::now())
    }

    async fn previous_session_ohlc(
        &self,
        instrument: &InstrumentId,
        date: NaiveDate,
    ) -> Result<Ohlc, FeedError> {
        let from = date - ChronoDuration::days(CANDLE_LOOKBACK_DAYS);
        let history = self.history(instrument, from, date).await?;
        debug!(
            instrument = %instrument,
            candles = history.candles.len(),
            target = %date,
            "Fetched daily history"
        );

        select_session_candle(&history.candles, date, self.utc_offset)
            .ok_or_else(|| FeedError::NoData(format!("{} on or before {}", instrument, date)))
    }
}

/// Raw daily candle: `[epoch_seconds, open, high, low, close, volume]`.
pub type RawCandle = [f64; 6];

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    candles: Vec<RawCandle>,
}

/// Fail on `{"s": "error"}` payloads, classifying token errors as permanent.
fn check_api_status(json: &serde_json::Value) -> Result<(), FeedError> {
    if json["s"].as_str() != Some("error") {
        return Ok(());
    }

    let code = json["code"].as_i64().unwrap_or(0);
    let message = json["message"].as_str().unwrap_or("unknown error").to_string();
    if AUTH_ERROR_CODES.contains(&code) {
        Err(FeedError::AuthenticationFailed(format!("code {}: {}", code, message)))
    } else if code == 429 {
        Err(FeedError::RateLimitExceeded)
    } else {
        Err(FeedError::Api { code, message })
    }
}

/// Read `d[0].v.lp` (and `prev_close_price` when present) from a quotes payload.
fn parse_quote(
    instrument: &InstrumentId,
    json: &serde_json::Value,
    observed_at: DateTime<Utc>,
) -> Result<PriceSample, FeedError> {
    let values = json["d"]
        .as_array()
        .and_then(|d| d.first())
        .map(|entry| &entry["v"])
        .ok_or_else(|| FeedError::NoData(format!("no quote for {}", instrument)))?;

    let price = values["lp"]
        .as_f64()
        .ok_or_else(|| FeedError::ParseError(format!("missing lp for {}", instrument)))?;

    let mut sample = PriceSample::new(instrument.clone(), price, observed_at);
    if let Some(prev_close) = values["prev_close_price"].as_f64().filter(|c| *c > 0.0) {
        sample = sample.with_prev_close(prev_close);
    }
    Ok(sample)
}

/// Pick the candle for `target`, or the closest earlier one within the
/// lookback window. Later candles are ignored.
pub fn select_session_candle(
    candles: &[RawCandle],
    target: NaiveDate,
    utc_offset: FixedOffset,
) -> Option<Ohlc> {
    let earliest = target - ChronoDuration::days(CANDLE_LOOKBACK_DAYS);

    candles
        .iter()
        .filter_map(|candle| {
            let date = DateTime::from_timestamp(candle[0] as i64, 0)?
                .with_timezone(&utc_offset)
                .date_naive();
            (date <= target && date >= earliest).then_some((date, candle))
        })
        .max_by_key(|(date, _)| *date)
        .map(|(date, candle)| Ohlc {
            open: candle[1],
            high: candle[2],
            low: candle[3],
            close: candle[4],
            date,
            volume: (candle[5] >= 0.0).then_some(candle[5] as u64),
            source: OhlcSource::Historical,
        })
}
