//! Application configuration.
//!
//! Settings come from a JSON file when one exists, otherwise from
//! environment variables. Every optional setting has a default.

use chrono::NaiveTime;
use cpr_alerts::{CooldownConfig, DispatcherConfig, MessageContext};
use cpr_core::{Instrument, RetryPolicy};
use cpr_engine::SessionSchedule;
use cpr_feeds::{PollerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const TIME_FORMAT: &str = "%H:%M";
const MAX_TOLERANCE: f64 = 0.05;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
    #[error("Invalid watch-list entry: {0:?}")]
    InvalidWatchlist(String),
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Where the configuration was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Environment { custom_watchlist: bool },
}

impl ConfigSource {
    /// Short description of the watch-list origin for the startup message.
    pub fn watchlist_label(&self) -> String {
        match self {
            ConfigSource::File(path) => format!("config file {}", path.display()),
            ConfigSource::Environment { custom_watchlist: true } => "STOCKS_CONFIG".to_string(),
            ConfigSource::Environment { custom_watchlist: false } => "default list".to_string(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub fyers: FyersSettings,
    pub telegram: TelegramSettings,
    /// Watch-list, polled in tier order
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub polling: PollingSettings,
    /// Backoff for deliveries and daily candle fetches
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub market: MarketSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FyersSettings {
    pub app_id: String,
    pub access_token: String,
    /// Override of the data API host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl std::fmt::Debug for FyersSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FyersSettings")
            .field("app_id", &self.app_id)
            .field("access_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Relative half-width of the band around each level (0.0005 = 0.05%)
    pub tolerance: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self { tolerance: 0.0005 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub calls_per_minute: u32,
    pub burst: u32,
    pub request_timeout_secs: u64,
    /// Consecutive rejected requests before the bot stops
    pub max_auth_failures: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            calls_per_minute: 10,
            burst: 1,
            request_timeout_secs: 10,
            max_auth_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub send_timeout_secs: u64,
    /// Time allowed for in-flight alerts at close and shutdown
    pub drain_timeout_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            send_timeout_secs: 10,
            drain_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub utc_offset_minutes: i32,
    /// Local times as "HH:MM"
    pub open: String,
    pub close: String,
    pub reset_at: String,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            reset_at: "09:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub retention_days: i64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://cpr_alerts.db".to_string(),
            retention_days: 30,
        }
    }
}

impl AppConfig {
    /// Read `path` if it exists, otherwise the process environment.
    pub fn load(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config = Self::from_json(&text)?;
            return Ok((config, ConfigSource::File(path.to_path_buf())));
        }
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Build from environment variables read through `get`.
    pub fn from_env_with(get: impl Fn(&str) -> Option<String>) -> Result<(Self, ConfigSource), ConfigError> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let required = ["FYERS_APP_ID", "FYERS_ACCESS_TOKEN", "TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID"];
        let missing: Vec<String> = required
            .iter()
            .filter(|key| var(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnv(missing));
        }

        let (instruments, custom_watchlist) = match var("STOCKS_CONFIG") {
            Some(list) => (parse_stocks_config(&list)?, true),
            None => (default_instruments(), false),
        };

        let mut storage = StorageSettings::default();
        if let Some(url) = var("CPR_DATABASE_URL") {
            storage.database_url = url;
        }

        let config = Self {
            fyers: FyersSettings {
                app_id: var("FYERS_APP_ID").unwrap_or_default(),
                access_token: var("FYERS_ACCESS_TOKEN").unwrap_or_default(),
                base_url: None,
            },
            telegram: TelegramSettings {
                bot_token: var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
                chat_id: var("TELEGRAM_CHAT_ID").unwrap_or_default(),
            },
            instruments,
            detection: DetectionSettings::default(),
            cooldown: CooldownConfig::default(),
            polling: PollingSettings::default(),
            retry: RetryPolicy::default(),
            delivery: DeliverySettings::default(),
            market: MarketSettings::default(),
            storage,
        };
        config.validate()?;
        Ok((config, ConfigSource::Environment { custom_watchlist }))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fyers.app_id.trim().is_empty() || self.fyers.access_token.trim().is_empty() {
            return Err(invalid("fyers", "app_id and access_token are required"));
        }
        if self.telegram.bot_token.trim().is_empty() || self.telegram.chat_id.trim().is_empty() {
            return Err(invalid("telegram", "bot_token and chat_id are required"));
        }
        if self.instruments.is_empty() {
            return Err(invalid("instruments", "watch-list is empty"));
        }
        if let Some(bad) = self.instruments.iter().find(|i| i.id.exchange().is_none()) {
            return Err(ConfigError::InvalidWatchlist(bad.id.to_string()));
        }

        let tolerance = self.detection.tolerance;
        if !(tolerance > 0.0 && tolerance < MAX_TOLERANCE) {
            return Err(invalid(
                "detection.tolerance",
                format!("{} is outside (0, {})", tolerance, MAX_TOLERANCE),
            ));
        }
        if self.cooldown.window_minutes <= 0 {
            return Err(invalid("cooldown.window_minutes", "must be positive"));
        }
        if self.polling.calls_per_minute == 0 {
            return Err(invalid("polling.calls_per_minute", "must be positive"));
        }
        if self.polling.burst == 0 {
            return Err(invalid("polling.burst", "must be positive"));
        }
        if self.polling.request_timeout_secs == 0 || self.delivery.send_timeout_secs == 0 {
            return Err(invalid("timeouts", "must be positive"));
        }
        if self.storage.retention_days <= 0 {
            return Err(invalid("storage.retention_days", "must be positive"));
        }

        self.schedule()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<SessionSchedule, ConfigError> {
        let open = parse_clock_time("market.open", &self.market.open)?;
        let close = parse_clock_time("market.close", &self.market.close)?;
        let reset_at = parse_clock_time("market.reset_at", &self.market.reset_at)?;
        SessionSchedule::new(self.market.utc_offset_minutes, open, close, reset_at)
            .map_err(|e| invalid("market", e.to_string()))
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            rate_limit: RateLimitConfig::new(self.polling.calls_per_minute, self.polling.burst),
            request_timeout: Duration::from_secs(self.polling.request_timeout_secs),
            max_auth_failures: self.polling.max_auth_failures.max(1),
            ohlc_retry: self.retry.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry: self.retry.clone(),
            send_timeout: Duration::from_secs(self.delivery.send_timeout_secs),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.drain_timeout_secs)
    }

    pub fn message_context(&self) -> Result<MessageContext, ConfigError> {
        Ok(MessageContext {
            utc_offset: self.schedule()?.offset(),
            cooldown_minutes: self.cooldown.window_minutes,
        })
    }

    /// Example configuration with placeholder credentials.
    pub fn sample() -> Self {
        Self {
            fyers: FyersSettings {
                app_id: "YOUR_APP_ID-100".to_string(),
                access_token: "YOUR_ACCESS_TOKEN".to_string(),
                base_url: None,
            },
            telegram: TelegramSettings {
                bot_token: "123456:YOUR_BOT_TOKEN".to_string(),
                chat_id: "-1001234567890".to_string(),
            },
            instruments: vec![
                Instrument::new("NSE:NIFTY50-INDEX", "NIFTY 50").with_tier(2),
                Instrument::new("NSE:RELIANCE-EQ", "RELIANCE"),
                Instrument::new("NSE:HDFCBANK-EQ", "HDFC BANK"),
                Instrument::new("NSE:TCS-EQ", "TCS"),
            ],
            detection: DetectionSettings::default(),
            cooldown: CooldownConfig::default(),
            polling: PollingSettings::default(),
            retry: RetryPolicy::default(),
            delivery: DeliverySettings::default(),
            market: MarketSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

fn parse_clock_time(field: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map_err(|_| invalid(field, format!("{:?} is not HH:MM", value)))
}

/// Parse `EXCH:SYMBOL:Name,EXCH:SYMBOL,...`. A missing name defaults to the
/// ticker; names may contain colons.
pub fn parse_stocks_config(list: &str) -> Result<Vec<Instrument>, ConfigError> {
    let mut instruments = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let exchange = parts.next().unwrap_or_default().trim();
        let symbol = parts.next().unwrap_or_default().trim();
        if exchange.is_empty() || symbol.is_empty() {
            return Err(ConfigError::InvalidWatchlist(entry.to_string()));
        }

        let id = format!("{}:{}", exchange, symbol);
        let instrument = match parts.next().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => Instrument::new(&id, name),
            None => {
                let ticker = cpr_core::InstrumentId::new(&id).ticker().to_string();
                Instrument::new(&id, ticker)
            }
        };
        instruments.push(instrument);
    }

    if instruments.is_empty() {
        return Err(ConfigError::InvalidWatchlist(list.to_string()));
    }
    Ok(instruments)
}

/// Major NSE/BSE indices and large caps. Indices are polled first.
pub fn default_instruments() -> Vec<Instrument> {
    const INDICES: &[(&str, &str)] = &[
        ("NSE:NIFTY50-INDEX", "NIFTY 50"),
        ("NSE:NIFTYBANK-INDEX", "BANK NIFTY"),
        ("NSE:FINNIFTY-INDEX", "NIFTY FINANCIAL"),
        ("BSE:SENSEX-INDEX", "BSE SENSEX"),
    ];
    const STOCKS: &[(&str, &str)] = &[
        ("NSE:RELIANCE-EQ", "RELIANCE"),
        ("NSE:HDFCBANK-EQ", "HDFC BANK"),
        ("NSE:ICICIBANK-EQ", "ICICI BANK"),
        ("NSE:AXISBANK-EQ", "AXIS BANK"),
        ("NSE:SBIN-EQ", "STATE BANK"),
        ("NSE:KOTAKBANK-EQ", "KOTAK BANK"),
        ("NSE:INDUSINDBK-EQ", "INDUSIND BANK"),
        ("NSE:FEDERALBNK-EQ", "FEDERAL BANK"),
        ("NSE:TCS-EQ", "TCS"),
        ("NSE:INFY-EQ", "INFOSYS"),
        ("NSE:HCLTECH-EQ", "HCL TECH"),
        ("NSE:TECHM-EQ", "TECH MAHINDRA"),
        ("NSE:WIPRO-EQ", "WIPRO"),
        ("NSE:LTIM-EQ", "LTI MINDTREE"),
        ("NSE:BAJFINANCE-EQ", "BAJAJ FINANCE"),
        ("NSE:BAJAJFINSV-EQ", "BAJAJ FINSERV"),
        ("NSE:SHRIRAMFIN-EQ", "SHRIRAM FINANCE"),
        ("NSE:TATAMOTORS-EQ", "TATA MOTORS"),
        ("NSE:M&M-EQ", "MAHINDRA"),
        ("NSE:MARUTI-EQ", "MARUTI"),
        ("NSE:BAJAJ-AUTO-EQ", "BAJAJ AUTO"),
        ("NSE:EICHERMOT-EQ", "EICHER MOTORS"),
        ("NSE:HEROMOTOCO-EQ", "HERO MOTOCORP"),
        ("NSE:TATASTEEL-EQ", "TATA STEEL"),
        ("NSE:JSWSTEEL-EQ", "JSW STEEL"),
        ("NSE:HINDALCO-EQ", "HINDALCO"),
        ("NSE:COALINDIA-EQ", "COAL INDIA"),
        ("NSE:ONGC-EQ", "ONGC"),
        ("NSE:IOC-EQ", "IOC"),
        ("NSE:BPCL-EQ", "BPCL"),
        ("NSE:ADANIENT-EQ", "ADANI ENT"),
        ("NSE:ADANIPORTS-EQ", "ADANI PORTS"),
        ("NSE:LT-EQ", "L&T"),
        ("NSE:POWERGRID-EQ", "POWER GRID"),
        ("NSE:NTPC-EQ", "NTPC"),
        ("NSE:SUNPHARMA-EQ", "SUN PHARMA"),
        ("NSE:DRREDDY-EQ", "DR REDDY"),
        ("NSE:CIPLA-EQ", "CIPLA"),
        ("NSE:DIVISLAB-EQ", "DIVI'S LAB"),
        ("NSE:APOLLOHOSP-EQ", "APOLLO HOSP"),
        ("NSE:HINDUNILVR-EQ", "HINDUSTAN UNILEVER"),
        ("NSE:ITC-EQ", "ITC"),
        ("NSE:NESTLEIND-EQ", "NESTLE"),
        ("NSE:BRITANNIA-EQ", "BRITANNIA"),
        ("NSE:ASIANPAINT-EQ", "ASIAN PAINTS"),
        ("NSE:ULTRACEMCO-EQ", "ULTRATECH CEMENT"),
        ("NSE:GRASIM-EQ", "GRASIM"),
        ("NSE:TITAN-EQ", "TITAN"),
        ("NSE:TRENT-EQ", "TRENT"),
        ("NSE:BHARTIARTL-EQ", "BHARTI AIRTEL"),
        ("NSE:BANKBARODA-EQ", "BANK OF BARODA"),
        ("NSE:PNB-EQ", "PNB"),
        ("NSE:CANBK-EQ", "CANARA BANK"),
        ("NSE:IRCTC-EQ", "IRCTC"),
        ("NSE:SAIL-EQ", "SAIL"),
        ("NSE:ZEEL-EQ", "ZEE ENTERTAINMENT"),
        ("NSE:VEDL-EQ", "VEDANTA"),
    ];

    INDICES
        .iter()
        .map(|(symbol, name)| Instrument::new(symbol, *name).with_tier(2))
        .chain(STOCKS.iter().map(|(symbol, name)| Instrument::new(symbol, *name)))
        .collect()
}
