//! Alert delivery for CPR level touches.
//!
//! This crate provides:
//! - SQLite storage of alert history and daily levels
//! - Cooldown deduplication that survives restarts
//! - Telegram delivery with retry

pub mod config;
pub mod cooldown;
pub mod db;
pub mod dispatcher;
pub mod notifier;
pub mod telegram;

#[cfg(test)]
mod test_support;

pub use config::{CooldownConfig, CooldownKey, CooldownScope, DispatcherConfig};
pub use cooldown::{AlertStore, CooldownDecision, CooldownStatus, CooldownStore, StoreError};
pub use db::{Database, DbError};
pub use dispatcher::{AlertDispatcher, Delivered, DeliveryError, NotificationChannel};
pub use notifier::{DrainReport, Notifier, NotifierError, NotifierStats, TouchOutcome};
pub use telegram::{MessageContext, TelegramChannel, TelegramError};
