//! Session controller.
//!
//! Drives the trading day: runs the daily level reset, polls prices while
//! the market is open, routes touches through cooldown to delivery, and
//! drains in-flight alerts when the session closes or the bot shuts down.

use crate::state::RunStats;
use chrono::{DateTime, NaiveDate, Utc};
use cpr_alerts::telegram::{format_daily_summary, format_status_report, StatusEntry, SummaryEntry};
use cpr_alerts::{Database, DbError, Notifier, NotifierError, TouchOutcome};
use cpr_core::{Clock, Instrument, InstrumentId, PriceSample, SessionLevels};
use cpr_engine::{most_significant, SessionPhase, SessionSchedule, TouchDetector};
use cpr_feeds::{PollOutcome, Poller, PollerError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest sleep between schedule checks outside market hours.
const IDLE_CHECK: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Market data unavailable: {0}")]
    Poller(#[from] PollerError),
    #[error(transparent)]
    Notifier(#[from] NotifierError),
    #[error("Level storage failed: {0}")]
    Storage(#[from] DbError),
}

/// Collaborators and settings of a controller.
pub struct ControllerParts {
    pub schedule: SessionSchedule,
    pub instruments: Vec<Instrument>,
    pub poller: Poller,
    pub detector: TouchDetector,
    pub notifier: Arc<Notifier>,
    pub db: Arc<Database>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<RunStats>,
    pub drain_timeout: Duration,
    pub retention_days: i64,
}

/// Outcome of a daily reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub trading_date: NaiveDate,
    pub loaded: usize,
    /// Instruments without usable data this session
    pub skipped: Vec<InstrumentId>,
}

pub struct SessionController {
    schedule: SessionSchedule,
    instruments: Vec<Instrument>,
    poller: Poller,
    detector: TouchDetector,
    notifier: Arc<Notifier>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    stats: Arc<RunStats>,
    drain_timeout: Duration,
    retention_days: i64,
    last_reset: Option<NaiveDate>,
    session_open: bool,
}

impl SessionController {
    pub fn new(parts: ControllerParts) -> Self {
        Self {
            schedule: parts.schedule,
            instruments: parts.instruments,
            poller: parts.poller,
            detector: parts.detector,
            notifier: parts.notifier,
            db: parts.db,
            clock: parts.clock,
            stats: parts.stats,
            drain_timeout: parts.drain_timeout,
            retention_days: parts.retention_days,
            last_reset: None,
            session_open: false,
        }
    }

    pub fn detector(&self) -> &TouchDetector {
        &self.detector
    }

    pub fn last_reset(&self) -> Option<NaiveDate> {
        self.last_reset
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!(
            instruments = self.instruments.len(),
            tolerance = self.detector.tolerance(),
            max_poll_interval_secs = self.poller.max_poll_interval().as_secs(),
            "Session controller started"
        );

        let result = self.run_loop(&mut shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Session controller stopped on fatal error");
        }

        let report = self.notifier.drain(self.drain_timeout).await;
        let summary = self.stats.summary(self.clock.now());
        info!(
            samples = summary.samples,
            touches = summary.touches,
            poll_failures = summary.poll_failures,
            drained = report.completed,
            aborted = report.aborted,
            "Session controller stopped"
        );
        result
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ControllerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let now = self.clock.now();
            if let Some(trading_date) = self.schedule.reset_due(now, self.last_reset) {
                self.daily_reset(trading_date).await?;
            }

            let phase = self.schedule.phase_at(now);
            if phase == SessionPhase::Open {
                if !self.session_open {
                    info!(
                        phase = %phase,
                        closes_in_mins = self.schedule.time_until_close(now).num_minutes(),
                        "Market open, polling prices"
                    );
                    self.session_open = true;
                }

                let polled = tokio::select! {
                    polled = self.poller.poll_next() => polled?,
                    _ = shutdown.changed() => return Ok(()),
                };
                // Not raced against shutdown: cooldown records are written here
                match polled {
                    PollOutcome::Sample(sample) => {
                        self.process_sample(&sample).await?;
                    }
                    PollOutcome::Failed { .. } => self.stats.record_poll_failure(),
                    PollOutcome::Idle => {
                        tokio::select! {
                            _ = tokio::time::sleep(IDLE_CHECK) => {}
                            _ = shutdown.changed() => return Ok(()),
                        }
                    }
                }
                continue;
            }

            if self.session_open {
                self.close_session(now).await;
            }

            let until_open = (self.schedule.next_open_after(now) - now)
                .to_std()
                .unwrap_or(IDLE_CHECK);
            tokio::select! {
                _ = tokio::time::sleep(until_open.min(IDLE_CHECK)) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Run one sample through detection and cooldown.
    pub async fn process_sample(&self, sample: &PriceSample) -> Result<Option<TouchOutcome>, ControllerError> {
        self.stats.record_sample();
        let Some((primary, others)) = most_significant(self.detector.on_sample(sample)) else {
            return Ok(None);
        };

        self.stats.record_touch();
        let outcome = self.notifier.handle_touch(primary, others, self.clock.now()).await?;
        if let TouchOutcome::Suppressed { remaining } = &outcome {
            debug!(
                instrument = %sample.instrument,
                remaining_secs = remaining.num_seconds(),
                "Touch within cooldown"
            );
        }
        Ok(Some(outcome))
    }

    /// Load or compute levels for `trading_date` and rearm the detector.
    ///
    /// Levels already persisted for the date are reused, so a restart during
    /// the session does not spend request budget on candles again.
    pub async fn daily_reset(&mut self, trading_date: NaiveDate) -> Result<ResetReport, ControllerError> {
        let source_date = self.schedule.source_session(trading_date);
        info!(%trading_date, %source_date, "Daily level reset");

        let mut stored: HashMap<InstrumentId, SessionLevels> = self
            .db
            .load_daily_levels(trading_date)
            .await?
            .into_iter()
            .map(|levels| (levels.instrument.clone(), levels))
            .collect();

        self.detector.clear();
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for instrument in &self.instruments {
            let levels = match stored.remove(&instrument.id) {
                Some(levels) => {
                    debug!(instrument = %instrument.id, "Using persisted levels");
                    levels
                }
                None => {
                    let ohlc = self.poller.fetch_session_ohlc(&instrument.id, source_date).await?;
                    match SessionLevels::compute(instrument.id.clone(), trading_date, ohlc) {
                        Ok(levels) => {
                            self.db.save_daily_levels(&levels).await?;
                            levels
                        }
                        Err(e) => {
                            warn!(instrument = %instrument.id, error = %e, "Skipping instrument for this session");
                            skipped.push(instrument.id.clone());
                            continue;
                        }
                    }
                }
            };

            self.detector.load_levels(levels.clone());
            entries.push(SummaryEntry {
                name: instrument.name.clone(),
                levels,
            });
        }

        self.notifier.cooldown().reset_daily_counters().await;
        self.prune_history().await?;
        self.last_reset = Some(trading_date);
        self.stats.record_reset();

        info!(
            %trading_date,
            loaded = entries.len(),
            skipped = skipped.len(),
            "Levels ready"
        );

        let skipped_names: Vec<String> = self
            .instruments
            .iter()
            .filter(|i| skipped.contains(&i.id))
            .map(|i| i.name.clone())
            .collect();
        let summary = format_daily_summary(trading_date, &entries, &skipped_names);
        if let Err(e) = self.notifier.send_text(&summary).await {
            warn!(error = %e, "Daily summary not delivered");
        }

        Ok(ResetReport {
            trading_date,
            loaded: entries.len(),
            skipped,
        })
    }

    async fn prune_history(&self) -> Result<(), ControllerError> {
        let now = self.clock.now();
        let alerts = self.db.cleanup_old_history(now, self.retention_days).await?;
        let levels = self.db.cleanup_old_levels(now, self.retention_days).await?;
        if alerts > 0 || levels > 0 {
            info!(alerts, levels, "Pruned old records");
        }
        Ok(())
    }

    /// Stop polling for the day: drain deliveries and report.
    async fn close_session(&mut self, now: DateTime<Utc>) {
        self.session_open = false;
        info!("Market closed, draining deliveries");
        self.notifier.drain(self.drain_timeout).await;

        let report = self.status_report(now).await;
        if let Err(e) = self.notifier.send_text(&report).await {
            warn!(error = %e, "Status report not delivered");
        }
    }

    /// Touch counts and cooldowns of the instruments with levels today.
    pub async fn status_report(&self, now: DateTime<Utc>) -> String {
        let cooldown = self.notifier.cooldown();
        let mut entries = Vec::new();

        for instrument in &self.instruments {
            let Some(levels) = self.detector.levels_for(&instrument.id) else {
                continue;
            };
            let status = cooldown.status(&instrument.id, now).await;
            entries.push(StatusEntry {
                name: instrument.name.clone(),
                levels,
                touches_today: status.touches_today,
                cooldown_remaining: status.remaining,
                pending: status.pending,
            });
        }

        format_status_report(now, self.instruments.len(), &entries, self.notifier.dispatcher().context())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone};
    use cpr_alerts::{
        AlertDispatcher, AlertStore, CooldownConfig, CooldownStore, Delivered, DeliveryError, DispatcherConfig,
        MessageContext, NotificationChannel, StoreError,
    };
    use cpr_core::{AlertRecord, LevelKind, ManualClock, Ohlc, RetryPolicy};
    use cpr_feeds::{FeedError, MarketDataProvider, PollerConfig, RateLimitConfig};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProvider {
        candles: Mutex<HashMap<String, Ohlc>>,
        quotes: Mutex<VecDeque<Result<f64, FeedError>>>,
        history_error: Option<FeedError>,
        history_calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn quote(&self, instrument: &InstrumentId) -> Result<PriceSample, FeedError> {
            let price = self.quotes.lock().unwrap().pop_front().unwrap_or(Ok(100.0))?;
            Ok(PriceSample::new(instrument.clone(), price, Utc::now()))
        }

        async fn previous_session_ohlc(&self, instrument: &InstrumentId, date: NaiveDate) -> Result<Ohlc, FeedError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.history_error {
                return Err(e.clone());
            }
            self.candles
                .lock()
                .unwrap()
                .get(instrument.as_str())
                .cloned()
                .ok_or_else(|| FeedError::NoData(date.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, text: &str) -> Result<Delivered, DeliveryError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(Delivered { messages: 1 })
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl AlertStore for BrokenStore {
        async fn append_alert(&self, _record: &AlertRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read-only filesystem".into()))
        }

        async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Store whose writes take long enough to overlap a shutdown signal.
    #[derive(Default)]
    struct SlowStore {
        started: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl AlertStore for SlowStore {
        async fn append_alert(&self, _record: &AlertRecord) -> Result<(), StoreError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(800)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// 10:00 IST on Monday 2024-06-10.
    fn monday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 4, 30, 0).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn friday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 7).unwrap()
    }

    fn instruments() -> Vec<Instrument> {
        vec![
            Instrument::new("NSE:SBIN-EQ", "STATE BANK"),
            Instrument::new("NSE:TCS-EQ", "TCS"),
        ]
    }

    struct Harness {
        controller: SessionController,
        provider: Arc<FakeProvider>,
        channel: Arc<RecordingChannel>,
        db: Arc<Database>,
    }

    async fn harness(provider: FakeProvider, store: Option<Arc<dyn AlertStore>>) -> Harness {
        let provider = Arc::new(provider);
        let channel = Arc::new(RecordingChannel::default());
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let store: Arc<dyn AlertStore> = match store {
            Some(store) => store,
            None => db.clone(),
        };

        let cooldown = Arc::new(CooldownStore::new(CooldownConfig::default(), store));
        let dispatcher = Arc::new(AlertDispatcher::new(
            channel.clone(),
            DispatcherConfig::default(),
            MessageContext::default(),
        ));
        let notifier = Arc::new(Notifier::new(cooldown, dispatcher, &instruments()));

        let poller_config = PollerConfig {
            rate_limit: RateLimitConfig::new(600, 1),
            request_timeout: Duration::from_secs(5),
            max_auth_failures: 3,
            ohlc_retry: RetryPolicy::new(10, 100, 1).without_jitter(),
        };
        let provider_dyn: Arc<dyn MarketDataProvider> = provider.clone();

        let controller = SessionController::new(ControllerParts {
            schedule: SessionSchedule::new(330, hm(9, 15), hm(15, 30), hm(9, 0)).unwrap(),
            instruments: instruments(),
            poller: Poller::new(provider_dyn, &instruments(), poller_config),
            detector: TouchDetector::new(0.0005),
            notifier,
            db: db.clone(),
            clock: Arc::new(ManualClock::new(monday_morning())),
            stats: Arc::new(RunStats::new(monday_morning())),
            drain_timeout: Duration::from_secs(5),
            retention_days: 30,
        });

        Harness {
            controller,
            provider,
            channel,
            db,
        }
    }

    fn provider_with_sbin_candle() -> FakeProvider {
        let provider = FakeProvider::default();
        provider
            .candles
            .lock()
            .unwrap()
            .insert("NSE:SBIN-EQ".to_string(), Ohlc::new(100.0, 104.0, 96.0, 101.5, friday()));
        provider
    }

    fn sample(price: f64) -> PriceSample {
        PriceSample::new(InstrumentId::new("NSE:SBIN-EQ"), price, monday_morning())
    }

    #[tokio::test]
    async fn test_daily_reset_computes_and_persists() {
        let mut h = harness(provider_with_sbin_candle(), None).await;

        let report = h.controller.daily_reset(monday()).await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, vec![InstrumentId::new("NSE:TCS-EQ")]);
        assert_eq!(h.controller.last_reset(), Some(monday()));

        let levels = h.controller.detector().levels_for(&InstrumentId::new("NSE:SBIN-EQ")).unwrap();
        assert_eq!(levels.levels.r1, 105.0);
        assert_eq!(levels.levels.s1, 97.0);

        let stored = h.db.load_daily_levels(monday()).await.unwrap();
        assert_eq!(stored, vec![levels]);

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("CPR Levels for 10/06/2024"));
        assert!(sent[0].contains("Skipped (no data):</b> TCS"));
    }

    #[tokio::test]
    async fn test_daily_reset_reuses_persisted_levels() {
        let mut h = harness(provider_with_sbin_candle(), None).await;
        h.controller.daily_reset(monday()).await.unwrap();
        let calls_after_first = h.provider.history_calls.load(Ordering::SeqCst);

        h.controller.daily_reset(monday()).await.unwrap();
        // Only the instrument without stored levels is fetched again
        assert_eq!(h.provider.history_calls.load(Ordering::SeqCst), calls_after_first + 1);
    }

    #[tokio::test]
    async fn test_touch_dispatched_once_per_window() {
        let mut h = harness(provider_with_sbin_candle(), None).await;
        h.controller.daily_reset(monday()).await.unwrap();

        assert_eq!(h.controller.process_sample(&sample(104.0)).await.unwrap(), None);
        let touch = h.controller.process_sample(&sample(104.98)).await.unwrap();
        assert_eq!(touch, Some(TouchOutcome::Dispatched { touch_number: 1 }));

        // Leave and re-enter: detected again but suppressed
        h.controller.process_sample(&sample(104.0)).await.unwrap();
        let again = h.controller.process_sample(&sample(104.99)).await.unwrap();
        assert!(matches!(again, Some(TouchOutcome::Suppressed { .. })));

        h.controller.notifier.drain(Duration::from_secs(5)).await;
        let alerts: Vec<String> = h
            .channel
            .sent()
            .into_iter()
            .filter(|m| m.contains("Touch Alert"))
            .collect();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("R1 Touch Alert"));
        assert_eq!(h.db.latest_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_rearms_detector() {
        let mut h = harness(provider_with_sbin_candle(), None).await;
        h.controller.daily_reset(monday()).await.unwrap();
        h.controller.process_sample(&sample(104.0)).await.unwrap();

        h.controller.daily_reset(monday()).await.unwrap();
        let id = InstrumentId::new("NSE:SBIN-EQ");
        assert_eq!(h.controller.detector().side_of(&id, LevelKind::R1), Some(cpr_core::Side::Unknown));

        // First sample of the new day never fires, even inside a band
        assert_eq!(h.controller.process_sample(&sample(104.98)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let mut h = harness(provider_with_sbin_candle(), Some(Arc::new(BrokenStore))).await;
        h.controller.daily_reset(monday()).await.unwrap();
        h.controller.process_sample(&sample(104.0)).await.unwrap();

        let err = h.controller.process_sample(&sample(104.98)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Notifier(NotifierError::Storage(_))));
    }

    #[tokio::test]
    async fn test_rejected_credentials_stop_the_run() {
        let provider = FakeProvider {
            history_error: Some(FeedError::AuthenticationFailed("invalid token".into())),
            ..Default::default()
        };
        provider
            .quotes
            .lock()
            .unwrap()
            .extend((0..5).map(|_| Err(FeedError::AuthenticationFailed("invalid token".into()))));
        let mut h = harness(provider, None).await;

        let (_tx, rx) = watch::channel(false);
        let err = h.controller.run(rx).await.unwrap_err();
        assert!(matches!(err, ControllerError::Poller(PollerError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cooldown_write() {
        let provider = provider_with_sbin_candle();
        // First quote feeds the TCS fallback during the reset, then SBIN
        // approaches R1 from below and enters the band
        provider
            .quotes
            .lock()
            .unwrap()
            .extend([Ok(100.0), Ok(104.0), Ok(104.0), Ok(104.98), Ok(104.98)]);
        let store = Arc::new(SlowStore::default());
        let mut h = harness(provider, Some(store.clone())).await;

        let (tx, rx) = watch::channel(false);
        let signal = async {
            while store.started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(h.controller.run(rx), signal);

        result.unwrap();
        assert_eq!(store.started.load(Ordering::SeqCst), 1);
        assert_eq!(store.completed.load(Ordering::SeqCst), 1);
        let alerts = h.channel.sent().into_iter().filter(|m| m.contains("Touch Alert")).count();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let mut h = harness(provider_with_sbin_candle(), None).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        h.controller.run(rx).await.unwrap();
        assert_eq!(h.controller.last_reset(), None);
    }

    #[tokio::test]
    async fn test_status_report_lists_active_instruments() {
        let mut h = harness(provider_with_sbin_candle(), None).await;
        h.controller.daily_reset(monday()).await.unwrap();
        h.controller.process_sample(&sample(104.0)).await.unwrap();
        h.controller.process_sample(&sample(104.98)).await.unwrap();

        let report = h.controller.status_report(monday_morning()).await;
        assert!(report.contains("<b>STATE BANK</b>"));
        assert!(report.contains("Total touches: 1"));
        assert!(report.contains("In cooldown: 30m left"));
    }
}
