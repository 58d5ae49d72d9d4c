//! SQLite database for alert history and daily levels.

use crate::cooldown::{AlertStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use cpr_core::{AlertRecord, CprLevels, InstrumentId, LevelKind, Ohlc, OhlcSource, SessionLevels};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Corrupt row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

type AlertRow = (String, String, f64, f64, i64);

type LevelsRow = (
    String,
    String,
    f64,
    f64,
    f64,
    f64,
    f64,
    String,
    f64,
    f64,
    f64,
    f64,
    Option<i64>,
    String,
);

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Database connection for alerts.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite database at the given URL, creating it if missing.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // Every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                level TEXT NOT NULL,
                level_value REAL NOT NULL,
                price REAL NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alert_history_instrument
            ON alert_history(instrument, created_at_ms)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_levels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                trading_date TEXT NOT NULL,
                pivot REAL NOT NULL,
                tc REAL NOT NULL,
                bc REAL NOT NULL,
                r1 REAL NOT NULL,
                s1 REAL NOT NULL,
                source_date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER,
                source TEXT NOT NULL,
                UNIQUE(instrument, trading_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an alert in history.
    pub async fn record_alert(&self, record: &AlertRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO alert_history (instrument, level, level_value, price, created_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.instrument.as_str())
        .bind(record.level.as_str())
        .bind(record.level_value)
        .bind(record.price)
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent alert per (instrument, level).
    pub async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, DbError> {
        // SQLite returns the bare columns of the row holding the MAX
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT instrument, level, level_value, price, MAX(created_at_ms)
            FROM alert_history
            GROUP BY instrument, level
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(alert_from_row).collect()
    }

    /// Store levels for a trading day, replacing any earlier computation.
    pub async fn save_daily_levels(&self, levels: &SessionLevels) -> Result<(), DbError> {
        let source = &levels.source;
        sqlx::query(
            r#"
            INSERT INTO daily_levels (
                instrument, trading_date, pivot, tc, bc, r1, s1,
                source_date, open, high, low, close, volume, source
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(instrument, trading_date) DO UPDATE SET
                pivot = excluded.pivot,
                tc = excluded.tc,
                bc = excluded.bc,
                r1 = excluded.r1,
                s1 = excluded.s1,
                source_date = excluded.source_date,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                source = excluded.source
            "#,
        )
        .bind(levels.instrument.as_str())
        .bind(levels.trading_date.format(DATE_FORMAT).to_string())
        .bind(levels.levels.pivot)
        .bind(levels.levels.tc)
        .bind(levels.levels.bc)
        .bind(levels.levels.r1)
        .bind(levels.levels.s1)
        .bind(source.date.format(DATE_FORMAT).to_string())
        .bind(source.open)
        .bind(source.high)
        .bind(source.low)
        .bind(source.close)
        .bind(source.volume.map(|v| v as i64))
        .bind(source.source.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Levels persisted for a trading day.
    pub async fn load_daily_levels(&self, trading_date: NaiveDate) -> Result<Vec<SessionLevels>, DbError> {
        let rows = sqlx::query_as::<_, LevelsRow>(
            r#"
            SELECT instrument, trading_date, pivot, tc, bc, r1, s1,
                   source_date, open, high, low, close, volume, source
            FROM daily_levels
            WHERE trading_date = ?
            ORDER BY id
            "#,
        )
        .bind(trading_date.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(levels_from_row).collect()
    }

    /// Delete alerts recorded more than `days` before `now`.
    pub async fn cleanup_old_history(&self, now: DateTime<Utc>, days: i64) -> Result<u64, DbError> {
        let cutoff = now - Duration::days(days);
        let result = sqlx::query("DELETE FROM alert_history WHERE created_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Drop levels of trading days older than `days`.
    pub async fn cleanup_old_levels(&self, now: DateTime<Utc>, days: i64) -> Result<u64, DbError> {
        let cutoff = (now - Duration::days(days)).date_naive();
        let result = sqlx::query("DELETE FROM daily_levels WHERE trading_date < ?")
            .bind(cutoff.format(DATE_FORMAT).to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl AlertStore for Database {
    async fn append_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        Ok(self.record_alert(record).await?)
    }

    async fn latest_alerts(&self) -> Result<Vec<AlertRecord>, StoreError> {
        Ok(Database::latest_alerts(self).await?)
    }
}

fn alert_from_row((instrument, level, level_value, price, created_at_ms): AlertRow) -> Result<AlertRecord, DbError> {
    let invalid = |reason: String| DbError::InvalidRow {
        table: "alert_history",
        reason,
    };
    let level = LevelKind::parse(&level).ok_or_else(|| invalid(format!("unknown level {}", level)))?;
    let timestamp = DateTime::from_timestamp_millis(created_at_ms)
        .ok_or_else(|| invalid(format!("bad timestamp {}", created_at_ms)))?;

    Ok(AlertRecord {
        instrument: InstrumentId::new(&instrument),
        level,
        level_value,
        price,
        timestamp,
    })
}

fn levels_from_row(row: LevelsRow) -> Result<SessionLevels, DbError> {
    let (instrument, trading_date, pivot, tc, bc, r1, s1, source_date, open, high, low, close, volume, source) =
        row;
    let parse_date = |value: &str| {
        NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| DbError::InvalidRow {
            table: "daily_levels",
            reason: format!("bad date {}: {}", value, e),
        })
    };

    Ok(SessionLevels {
        instrument: InstrumentId::new(&instrument),
        trading_date: parse_date(&trading_date)?,
        levels: CprLevels { pivot, tc, bc, r1, s1 },
        source: Ohlc {
            open,
            high,
            low,
            close,
            date: parse_date(&source_date)?,
            volume: volume.map(|v| v.max(0) as u64),
            source: OhlcSource::parse(&source),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record(symbol: &str, level: LevelKind, at: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            instrument: InstrumentId::new(symbol),
            level,
            level_value: 105.0,
            price: 104.98,
            timestamp: at,
        }
    }

    fn session(symbol: &str, trading_date: NaiveDate) -> SessionLevels {
        let source_date = cpr_core::previous_trading_day(trading_date);
        let ohlc = Ohlc::new(100.0, 104.0, 96.0, 101.5, source_date);
        SessionLevels::compute(InstrumentId::new(symbol), trading_date, Some(ohlc)).unwrap()
    }

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        assert!(db.latest_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_alert_per_level() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap();

        db.record_alert(&record("NSE:SBIN-EQ", LevelKind::R1, t0)).await.unwrap();
        db.record_alert(&record("NSE:SBIN-EQ", LevelKind::R1, t0 + Duration::minutes(40)))
            .await
            .unwrap();
        db.record_alert(&record("NSE:SBIN-EQ", LevelKind::S1, t0 + Duration::minutes(5)))
            .await
            .unwrap();

        let mut latest = db.latest_alerts().await.unwrap();
        latest.sort_by_key(|r| r.level);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].level, LevelKind::S1);
        assert_eq!(latest[1].level, LevelKind::R1);
        assert_eq!(latest[1].timestamp, t0 + Duration::minutes(40));
    }

    #[tokio::test]
    async fn test_daily_levels_upsert() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

        let levels = session("NSE:SBIN-EQ", monday);
        db.save_daily_levels(&levels).await.unwrap();
        db.save_daily_levels(&levels).await.unwrap();

        let loaded = db.load_daily_levels(monday).await.unwrap();
        assert_eq!(loaded, vec![levels]);
        assert!(db
            .load_daily_levels(monday.succ_opt().unwrap())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_old_history() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap();
        db.record_alert(&record("NSE:SBIN-EQ", LevelKind::R1, now - Duration::days(40)))
            .await
            .unwrap();
        db.record_alert(&record("NSE:SBIN-EQ", LevelKind::S1, now - Duration::days(29)))
            .await
            .unwrap();

        assert_eq!(db.cleanup_old_history(now, 30).await.unwrap(), 1);
        let remaining = db.latest_alerts().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].level, LevelKind::S1);

        // Cutoff follows the given time, not the wall clock
        assert_eq!(db.cleanup_old_history(now + Duration::days(20), 30).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_old_levels() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let old = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let recent = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        db.save_daily_levels(&session("NSE:SBIN-EQ", old)).await.unwrap();
        db.save_daily_levels(&session("NSE:SBIN-EQ", recent)).await.unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap();
        assert_eq!(db.cleanup_old_levels(now, 30).await.unwrap(), 1);
        assert!(db.load_daily_levels(old).await.unwrap().is_empty());
        assert_eq!(db.load_daily_levels(recent).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("alerts.db").display());
        let t0 = Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap();

        {
            let db = Database::connect(&url).await.unwrap();
            db.record_alert(&record("NSE:SBIN-EQ", LevelKind::Pivot, t0)).await.unwrap();
            db.close().await;
        }

        let db = Database::connect(&url).await.unwrap();
        let latest = db.latest_alerts().await.unwrap();
        assert_eq!(latest, vec![record("NSE:SBIN-EQ", LevelKind::Pivot, t0)]);
    }
}
