//! CPR Alert Bot - Headless Server
//!
//! Polls live prices for a watch-list during market hours and sends a
//! Telegram alert when price touches the day's CPR levels.

mod config;
mod controller;
mod state;

use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{AppConfig, ConfigError, ConfigSource};
use controller::{ControllerError, ControllerParts, SessionController};
use cpr_alerts::telegram::{format_startup, StartupInfo};
use cpr_alerts::{
    AlertDispatcher, CooldownStore, Database, DbError, DeliveryError, Notifier, StoreError, TelegramChannel,
    TelegramError,
};
use cpr_core::{Clock, SessionLevels, SystemClock};
use cpr_engine::TouchDetector;
use cpr_feeds::{FeedError, FyersClient, FyersCredentials, MarketDataProvider, Poller, PollerError};
use state::RunStats;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// CPR Alert Bot CLI
#[derive(Parser, Debug)]
#[command(name = "cpr-bot")]
#[command(about = "CPR level touch alerts for NSE/BSE instruments", long_about = None)]
struct Args {
    /// Configuration file path (environment variables are used when absent)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Log level: trace, debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Monitor the watch-list (default)
    Run,
    /// Compute and print today's levels
    Levels,
    /// Check market data and Telegram credentials
    TestConnection,
    /// Print an example configuration file
    SampleConfig,
}

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Alert store error: {0}")]
    Store(#[from] StoreError),
    #[error("Market data error: {0}")]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Poller(#[from] PollerError),
    #[error("Telegram error: {0}")]
    Telegram(#[from] TelegramError),
    #[error("Telegram delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn market_data_client(config: &AppConfig) -> Result<FyersClient, AppError> {
    let credentials = FyersCredentials {
        app_id: config.fyers.app_id.clone(),
        access_token: config.fyers.access_token.clone(),
    };
    let schedule = config.schedule()?;
    let client = FyersClient::new(credentials, config.poller_config().request_timeout, schedule.offset())?;
    Ok(match &config.fyers.base_url {
        Some(url) => client.with_base_url(url.clone()),
        None => client,
    })
}

async fn run(config: AppConfig, source: ConfigSource) -> Result<(), AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let schedule = config.schedule()?;
    let context = config.message_context()?;

    info!("🚀 CPR Alert Bot starting...");
    info!("  Instruments: {} ({})", config.instruments.len(), source.watchlist_label());
    info!("  Tolerance: {}%", config.detection.tolerance * 100.0);
    info!(
        "  Cooldown: {} min ({:?})",
        config.cooldown.window_minutes, config.cooldown.scope
    );
    info!("  Request budget: {}/min", config.polling.calls_per_minute);
    info!(
        "  Market hours: {} - {} (UTC{})",
        config.market.open,
        config.market.close,
        schedule.offset()
    );

    let db = Arc::new(Database::connect(&config.storage.database_url).await?);
    let cooldown = Arc::new(CooldownStore::restore(db.clone(), config.cooldown.clone()).await?);

    let channel = Arc::new(TelegramChannel::new(&config.telegram.bot_token, &config.telegram.chat_id)?);
    let dispatcher = Arc::new(AlertDispatcher::new(channel, config.dispatcher_config(), context.clone()));
    let notifier = Arc::new(Notifier::new(cooldown, dispatcher, &config.instruments));

    let provider: Arc<dyn MarketDataProvider> = Arc::new(market_data_client(&config)?);
    let poller = Poller::new(provider, &config.instruments, config.poller_config());
    let stats = Arc::new(RunStats::new(clock.now()));

    let startup = format_startup(
        &StartupInfo {
            instruments: &config.instruments,
            watchlist_source: &source.watchlist_label(),
            calls_per_minute: config.polling.calls_per_minute,
            tolerance: config.detection.tolerance,
            started_at: stats.started_at(),
        },
        &context,
    );
    if let Err(e) = notifier.send_text(&startup).await {
        warn!(error = %e, "Startup message not delivered");
    }

    let mut controller = SessionController::new(ControllerParts {
        schedule,
        instruments: config.instruments.clone(),
        poller,
        detector: TouchDetector::new(config.detection.tolerance),
        notifier,
        db: db.clone(),
        clock,
        stats,
        drain_timeout: config.drain_timeout(),
        retention_days: config.storage.retention_days,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    info!("Press Ctrl+C to stop...");
    let result = controller.run(shutdown_rx).await;
    db.close().await;
    result?;

    info!("👋 CPR Alert Bot stopped");
    Ok(())
}

/// Print today's levels without sending anything.
async fn print_levels(config: AppConfig) -> Result<(), AppError> {
    let schedule = config.schedule()?;
    let trading_date = schedule.local_date(Utc::now());
    let source_date = schedule.source_session(trading_date);

    let provider: Arc<dyn MarketDataProvider> = Arc::new(market_data_client(&config)?);
    let mut poller = Poller::new(provider, &config.instruments, config.poller_config());

    println!("CPR levels for {} (from {} session)", trading_date, source_date);
    println!(
        "{:<22} {:>10} {:>10} {:>10} {:>10} {:>10}  source",
        "instrument", "S1", "BC", "PIVOT", "TC", "R1"
    );

    for instrument in &config.instruments {
        let ohlc = poller.fetch_session_ohlc(&instrument.id, source_date).await?;
        match SessionLevels::compute(instrument.id.clone(), trading_date, ohlc) {
            Ok(session) => {
                let l = &session.levels;
                println!(
                    "{:<22} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>10.2}  {}",
                    instrument.name,
                    l.s1,
                    l.bc,
                    l.pivot,
                    l.tc,
                    l.r1,
                    session.source.source.as_str()
                );
            }
            Err(e) => println!("{:<22} skipped: {}", instrument.name, e),
        }
    }
    Ok(())
}

async fn test_connection(config: AppConfig) -> Result<(), AppError> {
    let client = market_data_client(&config)?;
    match config.instruments.first() {
        Some(instrument) => {
            let price = client.last_traded_price(&instrument.id).await?;
            println!("✅ Market data: {} last traded at {:.2}", instrument.name, price);
        }
        None => println!("⚠️ Market data: no instruments configured"),
    }

    let channel = TelegramChannel::new(&config.telegram.bot_token, &config.telegram.chat_id)?;
    let username = channel.check().await?;
    println!("✅ Telegram: connected as @{}", username);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);

    if command == Command::SampleConfig {
        return match serde_json::to_string_pretty(&AppConfig::sample()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to render sample config: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    init_logging(&args.log_level);

    let (config, source) = match AppConfig::load(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Run => run(config, source).await,
        Command::Levels => print_levels(config).await,
        Command::TestConnection => test_connection(config).await,
        Command::SampleConfig => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Exiting with failure");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let args = Args::try_parse_from(["cpr-bot"]).unwrap();
        assert_eq!(args.command, None);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_subcommands_and_global_flags() {
        let args = Args::try_parse_from(["cpr-bot", "levels", "--config", "prod.json", "-l", "debug"]).unwrap();
        assert_eq!(args.command, Some(Command::Levels));
        assert_eq!(args.config, PathBuf::from("prod.json"));
        assert_eq!(args.log_level, "debug");

        let args = Args::try_parse_from(["cpr-bot", "test-connection"]).unwrap();
        assert_eq!(args.command, Some(Command::TestConnection));

        let args = Args::try_parse_from(["cpr-bot", "sample-config"]).unwrap();
        assert_eq!(args.command, Some(Command::SampleConfig));
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Args::try_parse_from(["cpr-bot", "backtest"]).is_err());
    }
}
