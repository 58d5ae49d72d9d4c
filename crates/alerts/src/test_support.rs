//! In-memory doubles for the store and channel traits.

use crate::cooldown::{AlertStore, StoreError};
use crate::dispatcher::{Delivered, DeliveryError, NotificationChannel};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cpr_core::{AlertRecord, InstrumentId, LevelKind, Side, TouchAlert, TouchEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<AlertRecord>>,
}

impl MemoryStore {
    pub fn records(&self) -> Vec<AlertRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn append_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let mut latest: HashMap<(InstrumentId, LevelKind), AlertRecord> = HashMap::new();
        for record in self.records.lock().unwrap().iter() {
            let key = (record.instrument.clone(), record.level);
            match latest.get(&key) {
                Some(existing) if existing.timestamp >= record.timestamp => {}
                _ => {
                    latest.insert(key, record.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }
}

pub struct FailingStore;

#[async_trait]
impl AlertStore for FailingStore {
    async fn append_alert(&self, _record: &AlertRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
}

/// Channel answering from a script, then succeeding.
#[derive(Default)]
pub struct ScriptedChannel {
    responses: Mutex<VecDeque<Result<Delivered, DeliveryError>>>,
    sent: Mutex<Vec<String>>,
    attempts: AtomicU32,
    delay: Option<Duration>,
    max_len: Option<usize>,
}

impl ScriptedChannel {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            ..Self::default()
        }
    }

    pub fn script(&self, response: Result<Delivered, DeliveryError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn max_message_len(&self) -> usize {
        self.max_len.unwrap_or(usize::MAX)
    }

    async fn send(&self, text: &str) -> Result<Delivered, DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Delivered { messages: 1 }));
        if response.is_ok() {
            self.sent.lock().unwrap().push(text.to_string());
        }
        response
    }
}

/// First R1 touch from below at 104.98 against a level of 105.
pub fn touch_alert(symbol: &str) -> TouchAlert {
    let id = InstrumentId::new(symbol);
    let name = id.ticker().to_string();
    let event = TouchEvent {
        instrument: id,
        level: LevelKind::R1,
        level_value: 105.0,
        price: 104.98,
        timestamp: Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap(),
        from_side: Side::Below,
    };
    TouchAlert::new(event, name)
}
