//! Alert notification logic.
//!
//! A touch first passes the cooldown store, which persists the alert record.
//! Only then is delivery spawned, so aborting an in-flight delivery never
//! cuts off a durable write.

use crate::cooldown::{CooldownDecision, CooldownStore, StoreError};
use crate::dispatcher::{AlertDispatcher, Delivered, DeliveryError};
use chrono::{DateTime, Duration, Utc};
use cpr_core::{Instrument, InstrumentId, LevelKind, TouchAlert, TouchEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Alert storage failed: {0}")]
    Storage(#[from] StoreError),
}

/// What happened to an offered touch.
#[derive(Debug, Clone, PartialEq)]
pub enum TouchOutcome {
    Dispatched { touch_number: u32 },
    Suppressed { remaining: Duration },
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub alerts_dispatched: u64,
    pub alerts_suppressed: u64,
    pub deliveries_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    suppressed: AtomicU64,
    failed: AtomicU64,
}

/// Result of waiting for in-flight deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub aborted: usize,
}

pub struct Notifier {
    cooldown: Arc<CooldownStore>,
    dispatcher: Arc<AlertDispatcher>,
    names: HashMap<InstrumentId, String>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Notifier {
    pub fn new(cooldown: Arc<CooldownStore>, dispatcher: Arc<AlertDispatcher>, instruments: &[Instrument]) -> Self {
        let names = instruments
            .iter()
            .map(|i| (i.id.clone(), i.name.clone()))
            .collect();
        Self {
            cooldown,
            dispatcher,
            names,
            in_flight: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn cooldown(&self) -> &Arc<CooldownStore> {
        &self.cooldown
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Display name of an instrument, falling back to its ticker.
    pub fn name_of(&self, instrument: &InstrumentId) -> String {
        self.names
            .get(instrument)
            .cloned()
            .unwrap_or_else(|| instrument.ticker().to_string())
    }

    /// Offer the most significant touch of a sample to the cooldown store and
    /// spawn its delivery when it clears.
    ///
    /// `simultaneous` lists other levels touched by the same sample. A storage
    /// failure is returned and no delivery is attempted.
    pub async fn handle_touch(
        &self,
        event: TouchEvent,
        simultaneous: Vec<LevelKind>,
        now: DateTime<Utc>,
    ) -> Result<TouchOutcome, NotifierError> {
        let decision = self.cooldown.try_claim(&event, now).await?;

        let (touch_number, mut also_touched) = match decision {
            CooldownDecision::Suppressed { remaining } => {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                return Ok(TouchOutcome::Suppressed { remaining });
            }
            CooldownDecision::Clear {
                touch_number,
                also_touched,
            } => (touch_number, also_touched),
        };

        for level in simultaneous {
            if level != event.level && !also_touched.contains(&level) {
                also_touched.push(level);
            }
        }

        let alert = TouchAlert {
            name: self.name_of(&event.instrument),
            event,
            touch_number,
            also_touched,
        };
        info!(
            instrument = %alert.event.instrument,
            level = %alert.event.level,
            price = alert.event.price,
            touch_number,
            "Dispatching touch alert"
        );

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let dispatcher = self.dispatcher.clone();
        let counters = self.counters.clone();
        let handle = tokio::spawn(async move {
            if dispatcher.dispatch(&alert).await.is_err() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        });

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);

        Ok(TouchOutcome::Dispatched { touch_number })
    }

    /// Send a non-alert message (summary, startup, status) inline.
    pub async fn send_text(&self, text: &str) -> Result<Delivered, DeliveryError> {
        self.dispatcher.send_text(text).await
    }

    pub async fn in_flight_count(&self) -> usize {
        let in_flight = self.in_flight.lock().await;
        in_flight.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait up to `timeout` for spawned deliveries, aborting what remains.
    pub async fn drain(&self, timeout: std::time::Duration) -> DrainReport {
        let handles = std::mem::take(&mut *self.in_flight.lock().await);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = DrainReport::default();

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.completed += 1,
                Err(_) => {
                    handle.abort();
                    report.aborted += 1;
                }
            }
        }

        if report.aborted > 0 {
            warn!(
                completed = report.completed,
                aborted = report.aborted,
                "Aborted deliveries still in flight"
            );
        } else {
            debug!(completed = report.completed, "Deliveries drained");
        }
        report
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            alerts_dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            alerts_suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            deliveries_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
