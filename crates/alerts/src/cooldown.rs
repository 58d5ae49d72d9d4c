//! Cooldown deduplication of alerts.
//!
//! The check and the durable write for a key happen under one async lock, so
//! two touches arriving together cannot both clear the same window. Records
//! are persisted before the in-memory window moves, and restored from the
//! store on startup.

use crate::config::{CooldownConfig, CooldownKey};
use crate::db::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cpr_core::{AlertRecord, InstrumentId, LevelKind, TouchEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Alert store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage of alert records.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn append_alert(&self, record: &AlertRecord) -> Result<(), StoreError>;

    /// Latest record per (instrument, level).
    async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError>;
}

/// Outcome of offering a touch to the cooldown store.
#[derive(Debug, Clone, PartialEq)]
pub enum CooldownDecision {
    /// Alert may be dispatched; the record has been persisted.
    Clear {
        /// Touches of this level today, including this one
        touch_number: u32,
        /// Levels touched while the window was closed
        also_touched: Vec<LevelKind>,
    },
    Suppressed { remaining: Duration },
}

impl CooldownDecision {
    pub fn is_clear(&self) -> bool {
        matches!(self, CooldownDecision::Clear { .. })
    }
}

#[derive(Debug, Default)]
struct CooldownEntry {
    last_alert: Option<DateTime<Utc>>,
    /// Touches per level since the last daily reset
    touches: HashMap<LevelKind, u32>,
    /// Levels touched while suppressed, in order of first touch
    pending: Vec<LevelKind>,
}

impl CooldownEntry {
    fn remaining(&self, now: DateTime<Utc>, window: Duration) -> Option<Duration> {
        let last = self.last_alert?;
        let elapsed = now - last;
        (elapsed < window).then(|| window - elapsed)
    }

    fn note_alert(&mut self, at: DateTime<Utc>) {
        if self.last_alert.map_or(true, |last| at > last) {
            self.last_alert = Some(at);
        }
    }
}

/// Per-instrument cooldown view for status reports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CooldownStatus {
    pub touches_today: u32,
    pub remaining: Option<Duration>,
    pub pending: Vec<LevelKind>,
}

pub struct CooldownStore {
    config: CooldownConfig,
    store: Arc<dyn AlertStore>,
    entries: DashMap<CooldownKey, Arc<Mutex<CooldownEntry>>>,
}

impl CooldownStore {
    pub fn new(config: CooldownConfig, store: Arc<dyn AlertStore>) -> Self {
        Self {
            config,
            store,
            entries: DashMap::new(),
        }
    }

    /// Build a store whose windows continue from the persisted records.
    pub async fn restore(store: Arc<dyn AlertStore>, config: CooldownConfig) -> Result<Self, StoreError> {
        let records = store.latest_alerts().await?;
        let cooldown = Self::new(config, store);

        for record in &records {
            let entry = cooldown.entry(&record.instrument, record.level);
            entry.lock().await.note_alert(record.timestamp);
        }

        info!(records = records.len(), scope = ?cooldown.config.scope, "Restored cooldown state");
        Ok(cooldown)
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    fn entry(&self, instrument: &InstrumentId, level: LevelKind) -> Arc<Mutex<CooldownEntry>> {
        let key = self.config.scope.key(instrument, level);
        self.entries.entry(key).or_default().clone()
    }

    pub async fn is_on_cooldown(&self, instrument: &InstrumentId, level: LevelKind, now: DateTime<Utc>) -> bool {
        self.remaining(instrument, level, now).await.is_some()
    }

    /// Time left in the window covering this level, if one is open.
    pub async fn remaining(
        &self,
        instrument: &InstrumentId,
        level: LevelKind,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let key = self.config.scope.key(instrument, level);
        let entry = self.entries.get(&key).map(|e| e.value().clone())?;
        let guard = entry.lock().await;
        guard.remaining(now, self.config.window())
    }

    /// Persist an alert, then start its window.
    pub async fn record_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        let entry = self.entry(&record.instrument, record.level);
        let mut guard = entry.lock().await;
        self.store.append_alert(record).await?;
        guard.note_alert(record.timestamp);
        Ok(())
    }

    /// Check the window for a touch and, when clear, record the alert.
    pub async fn try_claim(&self, event: &TouchEvent, now: DateTime<Utc>) -> Result<CooldownDecision, StoreError> {
        let entry = self.entry(&event.instrument, event.level);
        let mut guard = entry.lock().await;

        let touch_number = guard.touches.get(&event.level).copied().unwrap_or(0) + 1;

        if let Some(remaining) = guard.remaining(now, self.config.window()) {
            guard.touches.insert(event.level, touch_number);
            if !guard.pending.contains(&event.level) {
                guard.pending.push(event.level);
            }
            debug!(
                instrument = %event.instrument,
                level = %event.level,
                touch_number,
                remaining_secs = remaining.num_seconds(),
                "Touch suppressed by cooldown"
            );
            return Ok(CooldownDecision::Suppressed { remaining });
        }

        let mut record = event.to_record();
        record.timestamp = now;
        self.store.append_alert(&record).await?;
        guard.note_alert(now);
        guard.touches.insert(event.level, touch_number);

        let also_touched = std::mem::take(&mut guard.pending)
            .into_iter()
            .filter(|level| *level != event.level)
            .collect();

        Ok(CooldownDecision::Clear {
            touch_number,
            also_touched,
        })
    }

    /// Clear touch counters at the start of a trading day. Windows are kept.
    pub async fn reset_daily_counters(&self) {
        let entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut guard = entry.lock().await;
            guard.touches.clear();
            guard.pending.clear();
        }
    }

    /// Touch counts and window state across all keys of an instrument.
    pub async fn status(&self, instrument: &InstrumentId, now: DateTime<Utc>) -> CooldownStatus {
        let entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| &e.key().instrument == instrument)
            .map(|e| e.value().clone())
            .collect();

        let mut status = CooldownStatus::default();
        for entry in entries {
            let guard = entry.lock().await;
            status.touches_today += guard.touches.values().sum::<u32>();
            if let Some(remaining) = guard.remaining(now, self.config.window()) {
                status.remaining = Some(status.remaining.map_or(remaining, |r| r.max(remaining)));
            }
            for level in &guard.pending {
                if !status.pending.contains(level) {
                    status.pending.push(*level);
                }
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownScope;
    use crate::db::Database;
    use crate::test_support::{FailingStore, MemoryStore};
    use chrono::TimeZone;
    use cpr_core::Side;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap()
    }

    fn touch(symbol: &str, level: LevelKind, at: DateTime<Utc>) -> TouchEvent {
        TouchEvent {
            instrument: InstrumentId::new(symbol),
            level,
            level_value: 105.0,
            price: 104.98,
            timestamp: at,
            from_side: Side::Below,
        }
    }

    fn minutes(m: i64) -> Duration {
        Duration::minutes(m)
    }

    #[tokio::test]
    async fn test_second_touch_suppressed_regardless_of_level() {
        let store = Arc::new(MemoryStore::default());
        let cooldown = CooldownStore::new(CooldownConfig::default(), store.clone());

        let first = cooldown
            .try_claim(&touch("NSE:SBIN-EQ", LevelKind::R1, t0()), t0())
            .await
            .unwrap();
        assert!(first.is_clear());

        let second = cooldown
            .try_claim(&touch("NSE:SBIN-EQ", LevelKind::Pivot, t0() + minutes(2)), t0() + minutes(2))
            .await
            .unwrap();
        assert_eq!(second, CooldownDecision::Suppressed { remaining: minutes(28) });
        assert_eq!(store.records().len(), 1);

        // Other instruments are independent
        let other = cooldown
            .try_claim(&touch("NSE:TCS-EQ", LevelKind::R1, t0() + minutes(2)), t0() + minutes(2))
            .await
            .unwrap();
        assert!(other.is_clear());
    }

    #[tokio::test]
    async fn test_level_scope_tracks_levels_separately() {
        let config = CooldownConfig {
            window_minutes: 30,
            scope: CooldownScope::InstrumentLevel,
        };
        let cooldown = CooldownStore::new(config, Arc::new(MemoryStore::default()));

        assert!(cooldown
            .try_claim(&touch("NSE:SBIN-EQ", LevelKind::R1, t0()), t0())
            .await
            .unwrap()
            .is_clear());
        assert!(cooldown
            .try_claim(&touch("NSE:SBIN-EQ", LevelKind::S1, t0()), t0() + minutes(1))
            .await
            .unwrap()
            .is_clear());
        assert!(!cooldown
            .try_claim(&touch("NSE:SBIN-EQ", LevelKind::R1, t0()), t0() + minutes(1))
            .await
            .unwrap()
            .is_clear());
    }

    #[tokio::test]
    async fn test_window_boundary() {
        let cooldown = CooldownStore::new(CooldownConfig::default(), Arc::new(MemoryStore::default()));
        let id = InstrumentId::new("NSE:SBIN-EQ");

        cooldown.try_claim(&touch("NSE:SBIN-EQ", LevelKind::R1, t0()), t0()).await.unwrap();
        assert!(cooldown.is_on_cooldown(&id, LevelKind::S1, t0() + minutes(29)).await);
        assert!(!cooldown.is_on_cooldown(&id, LevelKind::S1, t0() + minutes(30)).await);
    }

    #[tokio::test]
    async fn test_touch_counting_and_also_touched() {
        let cooldown = CooldownStore::new(CooldownConfig::default(), Arc::new(MemoryStore::default()));
        let sym = "NSE:SBIN-EQ";

        cooldown.try_claim(&touch(sym, LevelKind::R1, t0()), t0()).await.unwrap();
        cooldown.try_claim(&touch(sym, LevelKind::R1, t0()), t0() + minutes(5)).await.unwrap();
        cooldown.try_claim(&touch(sym, LevelKind::S1, t0()), t0() + minutes(6)).await.unwrap();

        let status = cooldown.status(&InstrumentId::new(sym), t0() + minutes(10)).await;
        assert_eq!(status.touches_today, 3);
        assert_eq!(status.remaining, Some(minutes(20)));
        assert_eq!(status.pending, vec![LevelKind::R1, LevelKind::S1]);

        let decision = cooldown.try_claim(&touch(sym, LevelKind::R1, t0()), t0() + minutes(31)).await.unwrap();
        assert_eq!(
            decision,
            CooldownDecision::Clear {
                touch_number: 3,
                also_touched: vec![LevelKind::S1],
            }
        );
    }

    #[tokio::test]
    async fn test_reset_daily_counters_keeps_window() {
        let cooldown = CooldownStore::new(CooldownConfig::default(), Arc::new(MemoryStore::default()));
        let sym = "NSE:SBIN-EQ";
        let id = InstrumentId::new(sym);

        cooldown.try_claim(&touch(sym, LevelKind::R1, t0()), t0()).await.unwrap();
        cooldown.reset_daily_counters().await;

        let status = cooldown.status(&id, t0() + minutes(1)).await;
        assert_eq!(status.touches_today, 0);
        assert!(cooldown.is_on_cooldown(&id, LevelKind::R1, t0() + minutes(1)).await);
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_window_closed() {
        let cooldown = CooldownStore::new(CooldownConfig::default(), Arc::new(FailingStore));
        let result = cooldown.try_claim(&touch("NSE:SBIN-EQ", LevelKind::R1, t0()), t0()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        let id = InstrumentId::new("NSE:SBIN-EQ");
        assert!(!cooldown.is_on_cooldown(&id, LevelKind::R1, t0()).await);
        // Nothing recorded, nothing counted
        assert_eq!(cooldown.status(&id, t0()).await.touches_today, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_claims_clear_once() {
        let cooldown = Arc::new(CooldownStore::new(CooldownConfig::default(), Arc::new(MemoryStore::default())));

        let handles: Vec<_> = [LevelKind::R1, LevelKind::Pivot, LevelKind::S1, LevelKind::R1]
            .into_iter()
            .map(|level| {
                let cooldown = cooldown.clone();
                tokio::spawn(async move {
                    cooldown
                        .try_claim(&touch("NSE:SBIN-EQ", level, t0()), t0())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut cleared = 0;
        for handle in handles {
            if handle.await.unwrap().is_clear() {
                cleared += 1;
            }
        }
        assert_eq!(cleared, 1);
    }

    #[tokio::test]
    async fn test_record_alert_starts_window() {
        let store = Arc::new(MemoryStore::default());
        let cooldown = CooldownStore::new(CooldownConfig::default(), store.clone());
        let record = touch("NSE:SBIN-EQ", LevelKind::S1, t0()).to_record();

        cooldown.record_alert(&record).await.unwrap();
        assert_eq!(store.records(), vec![record]);
        assert!(cooldown.is_on_cooldown(&InstrumentId::new("NSE:SBIN-EQ"), LevelKind::R1, t0() + minutes(5)).await);
    }

    /// Restart with a persisted alert at t: t+10min suppressed, t+31min clear.
    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cpr.db").display());
        let sym = "NSE:SBIN-EQ";

        {
            let db = Arc::new(Database::connect(&url).await.unwrap());
            let cooldown = CooldownStore::new(CooldownConfig::default(), db.clone());
            assert!(cooldown.try_claim(&touch(sym, LevelKind::R1, t0()), t0()).await.unwrap().is_clear());
            db.close().await;
        }

        let db = Arc::new(Database::connect(&url).await.unwrap());
        let cooldown = CooldownStore::restore(db, CooldownConfig::default()).await.unwrap();

        let early = cooldown.try_claim(&touch(sym, LevelKind::S1, t0()), t0() + minutes(10)).await.unwrap();
        assert_eq!(early, CooldownDecision::Suppressed { remaining: minutes(20) });

        let late = cooldown.try_claim(&touch(sym, LevelKind::Pivot, t0()), t0() + minutes(31)).await.unwrap();
        assert!(late.is_clear());
    }
}
