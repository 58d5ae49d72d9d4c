//! Round-robin price polling within the request budget.
//!
//! The poller is the only component that calls the market-data provider.
//! Instruments are visited in tier order (highest first, then configuration
//! order), one instrument per acquired token, so with `N` instruments and a
//! budget of `B` calls per minute every instrument is refreshed at least
//! once every `ceil(N / B)` minutes.

use crate::error::FeedError;
use crate::provider::MarketDataProvider;
use crate::rate_limit::{RateLimitConfig, RateLimiter, RATE_WINDOW};
use chrono::NaiveDate;
use cpr_core::{Instrument, InstrumentId, Ohlc, PriceSample, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PollerError {
    #[error("Provider rejected {failures} consecutive requests: {last}")]
    Fatal { failures: u32, last: FeedError },
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub rate_limit: RateLimitConfig,
    /// Deadline for a single provider call
    pub request_timeout: Duration,
    /// Consecutive permanent failures before polling stops
    pub max_auth_failures: u32,
    /// Backoff for previous-session OHLC fetches
    pub ohlc_retry: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            request_timeout: Duration::from_secs(10),
            max_auth_failures: 3,
            ohlc_retry: RetryPolicy::default(),
        }
    }
}

/// Result of one poll slot.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Sample(PriceSample),
    /// Call failed; the instrument is retried on its next slot
    Failed {
        instrument: InstrumentId,
        error: FeedError,
    },
    /// Nothing to poll
    Idle,
}

pub struct Poller {
    provider: Arc<dyn MarketDataProvider>,
    limiter: RateLimiter,
    order: Vec<InstrumentId>,
    cursor: usize,
    config: PollerConfig,
    consecutive_permanent: u32,
    fatal: Option<PollerError>,
}

impl Poller {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        instruments: &[Instrument],
        config: PollerConfig,
    ) -> Self {
        let mut ranked: Vec<&Instrument> = instruments.iter().collect();
        // Stable sort keeps configuration order within a tier
        ranked.sort_by(|a, b| b.tier.cmp(&a.tier));
        let order = ranked.into_iter().map(|i| i.id.clone()).collect();

        Self {
            provider,
            limiter: RateLimiter::new(config.rate_limit),
            order,
            cursor: 0,
            config,
            consecutive_permanent: 0,
            fatal: None,
        }
    }

    /// Polling order of one cycle.
    pub fn order(&self) -> &[InstrumentId] {
        &self.order
    }

    /// Upper bound on the time between two polls of the same instrument.
    pub fn max_poll_interval(&self) -> Duration {
        let budget = self.config.rate_limit.calls_per_minute as usize;
        let cycles = self.order.len().div_ceil(budget).max(1);
        RATE_WINDOW * cycles as u32
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Wait for budget, then fetch the price of the next instrument.
    pub async fn poll_next(&mut self) -> Result<PollOutcome, PollerError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }
        if self.order.is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let instrument = self.order[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.order.len();

        self.limiter.acquire().await;
        let provider = self.provider.clone();
        let result = self
            .timed(provider.quote(&instrument), &instrument)
            .await
            .and_then(|sample| {
                if sample.is_valid() {
                    Ok(sample)
                } else {
                    Err(FeedError::ParseError(format!("invalid price {}", sample.price)))
                }
            });

        match self.observe(result)? {
            Ok(sample) => {
                debug!(instrument = %instrument, price = sample.price, "Polled price");
                Ok(PollOutcome::Sample(sample))
            }
            Err(error) => {
                warn!(instrument = %instrument, error = %error, "Price poll failed");
                Ok(PollOutcome::Failed { instrument, error })
            }
        }
    }

    /// Fetch the candle levels are computed from, through the same budget.
    ///
    /// Transient failures are retried with backoff. When the provider has no
    /// candle, the previous close from a quote is used as an estimate.
    /// `Ok(None)` means the instrument has no usable data this session.
    pub async fn fetch_session_ohlc(
        &mut self,
        instrument: &InstrumentId,
        date: NaiveDate,
    ) -> Result<Option<Ohlc>, PollerError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }

        let provider = self.provider.clone();
        let history = self
            .call_with_retry(instrument, || provider.previous_session_ohlc(instrument, date))
            .await?;

        match history {
            Ok(ohlc) => return Ok(Some(ohlc)),
            Err(FeedError::NoData(reason)) => {
                info!(instrument = %instrument, reason = %reason, "No daily candle, estimating from quote");
            }
            Err(error) => {
                warn!(instrument = %instrument, error = %error, "Daily candle fetch failed");
                return Ok(None);
            }
        }

        let quote = self
            .call_with_retry(instrument, || provider.quote(instrument))
            .await?;

        match quote {
            Ok(sample) => match sample.prev_close {
                Some(prev_close) => Ok(Some(Ohlc::estimate_from_close(prev_close, date))),
                None => {
                    warn!(instrument = %instrument, "Quote has no previous close");
                    Ok(None)
                }
            },
            Err(error) => {
                warn!(instrument = %instrument, error = %error, "Quote fallback failed");
                Ok(None)
            }
        }
    }

    async fn call_with_retry<T, F, Fut>(
        &mut self,
        instrument: &InstrumentId,
        mut call: F,
    ) -> Result<Result<T, FeedError>, PollerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            let result = self.timed(call(), instrument).await;

            match self.observe(result)? {
                Err(error) if error.is_transient() && self.config.ohlc_retry.should_retry(attempt + 1) => {
                    attempt += 1;
                    let backoff = self.config.ohlc_retry.calculate_delay_duration(attempt);
                    // Never retry sooner than the error class allows (a full window after 429)
                    let delay = error.suggested_retry_delay().map_or(backoff, |hint| hint.max(backoff));
                    warn!(
                        instrument = %instrument,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return Ok(other),
            }
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, FeedError>>,
        instrument: &InstrumentId,
    ) -> Result<T, FeedError> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(format!(
                "{} after {}ms",
                instrument,
                self.config.request_timeout.as_millis()
            ))),
        }
    }

    /// Track consecutive permanent failures and trip the fatal state.
    fn observe<T>(&mut self, result: Result<T, FeedError>) -> Result<Result<T, FeedError>, PollerError> {
        match &result {
            Ok(_) => self.consecutive_permanent = 0,
            Err(error) if error.is_permanent() => {
                self.consecutive_permanent += 1;
                if self.consecutive_permanent >= self.config.max_auth_failures {
                    let fatal = PollerError::Fatal {
                        failures: self.consecutive_permanent,
                        last: error.clone(),
                    };
                    error!(provider = self.provider.name(), error = %fatal, "Stopping polling");
                    self.fatal = Some(fatal.clone());
                    return Err(fatal);
                }
            }
            Err(_) => {}
        }
        Ok(result)
    }
}
