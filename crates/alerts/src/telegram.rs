//! Telegram delivery and message formatting.
//!
//! Messages use HTML parse mode. Every piece of dynamic text is escaped,
//! since instrument names such as "M&M" contain HTML metacharacters.

use crate::dispatcher::{Delivered, DeliveryError, NotificationChannel};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use cpr_core::{round2, Instrument, LevelKind, SessionLevels, TouchAlert};
use std::fmt::Write as _;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html::escape;
use teloxide::{ApiError, RequestError};
use thiserror::Error;

/// Telegram limit on the length of one message.
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Invalid chat id: {0}")]
    InvalidChatId(String),
}

/// Telegram bot posting to a single chat.
pub struct TelegramChannel {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: &str) -> Result<Self, TelegramError> {
        let chat_id = chat_id
            .trim()
            .parse::<i64>()
            .map_err(|_| TelegramError::InvalidChatId(chat_id.to_string()))?;
        Ok(Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        })
    }

    /// Verify the token by asking Telegram who the bot is.
    pub async fn check(&self) -> Result<String, DeliveryError> {
        let me = self.bot.get_me().await.map_err(classify_error)?;
        Ok(me.username().to_string())
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_len(&self) -> usize {
        MAX_MESSAGE_LEN
    }

    async fn send(&self, text: &str) -> Result<Delivered, DeliveryError> {
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(classify_error)?;
        Ok(Delivered { messages: 1 })
    }
}

/// Reason phrases of gateway errors passed through by the Bot API front end.
const SERVER_ERROR_PHRASES: [&str; 4] = [
    "Internal Server Error",
    "Bad Gateway",
    "Service Unavailable",
    "Gateway Timeout",
];

/// Network trouble and server-side failures are worth retrying; API
/// rejections are not.
///
/// A 5xx from the front end arrives as an HTML page, which teloxide reports
/// as invalid JSON.
fn classify_error(err: RequestError) -> DeliveryError {
    let message = err.to_string();
    let transient = match &err {
        RequestError::Network(_)
        | RequestError::Io(_)
        | RequestError::RetryAfter(_)
        | RequestError::InvalidJson { .. } => true,
        RequestError::Api(ApiError::Unknown(description)) => is_server_error(description),
        _ => false,
    };

    if transient {
        DeliveryError::Transient(message)
    } else {
        DeliveryError::Permanent(message)
    }
}

fn is_server_error(description: &str) -> bool {
    description.starts_with('5') || SERVER_ERROR_PHRASES.iter().any(|p| description.contains(p))
}

/// Split text into chunks of at most `max_len` characters, on line
/// boundaries where possible.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();

        if current_len + line_len > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_len {
            // A single line longer than the limit is cut on char boundaries
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_len) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Settings shown in or needed by message texts.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Exchange-local offset for displayed times
    pub utc_offset: FixedOffset,
    pub cooldown_minutes: i64,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            utc_offset: FixedOffset::east_opt(330 * 60).unwrap_or_else(|| Utc.fix()),
            cooldown_minutes: 30,
        }
    }
}

impl MessageContext {
    fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.utc_offset).format("%H:%M:%S").to_string()
    }
}

fn level_emoji(level: LevelKind) -> &'static str {
    match level {
        LevelKind::S1 => "📉",
        LevelKind::R1 => "🚨",
        LevelKind::Pivot => "⚖️",
    }
}

fn join_levels(levels: &[LevelKind]) -> String {
    levels.iter().map(|l| l.as_str()).collect::<Vec<_>>().join(", ")
}

/// Alert text for a touch that cleared cooldown.
pub fn format_touch_alert(alert: &TouchAlert, ctx: &MessageContext) -> String {
    let event = &alert.event;
    let name = escape(&alert.name);
    let level = event.level.as_str();

    let mut msg = format!("{} <b>{} Touch Alert</b>", level_emoji(event.level), level);
    if alert.touch_number > 1 {
        let _ = write!(msg, " <b>(Touch #{})</b>", alert.touch_number);
    }
    if !alert.also_touched.is_empty() {
        let _ = write!(msg, " <b>[Also: {}]</b>", join_levels(&alert.also_touched));
    }

    let _ = write!(
        msg,
        "\n<b>{}</b> touched {} level from {}!\n\n\
         📊 <b>Level:</b> <code>{:.2}</code>\n\
         💰 <b>Price:</b> <code>{:.2}</code> ({:+.2}%)\n\
         🕐 <b>Time:</b> <code>{}</code>",
        name,
        level,
        event.from_side,
        event.level_value,
        event.price,
        round2(event.distance_pct()),
        ctx.local_time(event.timestamp),
    );

    if event.level.is_key_level() {
        msg.push_str("\n\n🎯 <b>Key Level Alert</b> - Major support/resistance");
    }
    let _ = write!(
        msg,
        "\n⏰ <b>Next alert for {}:</b> {} minutes",
        name, ctx.cooldown_minutes
    );
    msg
}

/// One instrument's line in the daily summary.
#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub name: String,
    pub levels: SessionLevels,
}

/// Levels computed at the daily reset.
pub fn format_daily_summary(trading_date: NaiveDate, entries: &[SummaryEntry], skipped: &[String]) -> String {
    let mut msg = format!("🎯 <b>CPR Levels for {}</b>\n", trading_date.format("%d/%m/%Y"));

    if let Some(first) = entries.first() {
        let _ = writeln!(
            msg,
            "📅 <i>Based on {} data</i>",
            first.levels.source.date.format("%d/%m/%Y")
        );
    }
    msg.push('\n');

    for entry in entries {
        let levels = &entry.levels.levels;
        let source = &entry.levels.source;
        let _ = write!(
            msg,
            "📊 <b>{}</b>{}\n\
             OHLC: <code>{:.1}</code> | <code>{:.1}</code> | <code>{:.1}</code> | <code>{:.1}</code>\n\
             S1:<code>{:.1}</code> BC:<code>{:.1}</code> P:<code>{:.1}</code> TC:<code>{:.1}</code> R1:<code>{:.1}</code>\n\n",
            escape(&entry.name),
            if source.source == cpr_core::OhlcSource::QuotesEstimate { " (estimated)" } else { "" },
            source.open,
            source.high,
            source.low,
            source.close,
            levels.s1,
            levels.bc,
            levels.pivot,
            levels.tc,
            levels.r1,
        );
    }

    if !skipped.is_empty() {
        let names: Vec<String> = skipped.iter().map(|s| escape(s)).collect();
        let _ = write!(msg, "⚠️ <b>Skipped (no data):</b> {}", names.join(", "));
    }
    msg.trim_end().to_string()
}

/// Settings announced at startup.
#[derive(Debug, Clone)]
pub struct StartupInfo<'a> {
    pub instruments: &'a [Instrument],
    /// Where the watch-list came from
    pub watchlist_source: &'a str,
    pub calls_per_minute: u32,
    pub tolerance: f64,
    pub started_at: DateTime<Utc>,
}

pub fn format_startup(info: &StartupInfo<'_>, ctx: &MessageContext) -> String {
    let mut msg = String::from("🚀 <b>CPR Alert Bot Started</b>\n\n");
    let _ = write!(
        msg,
        "📅 <b>Startup Time:</b> <code>{}</code>\n\
         📊 <b>Instruments Monitored:</b> {}\n\
         📋 <b>Watch-list:</b> {}\n\
         ⚡ <b>Request Budget:</b> {}/min\n\
         🕕 <b>Cooldown Period:</b> {}min\n\
         🎯 <b>Tolerance:</b> {}%\n\n",
        info.started_at
            .with_timezone(&ctx.utc_offset)
            .format("%Y-%m-%d %H:%M:%S"),
        info.instruments.len(),
        escape(info.watchlist_source),
        info.calls_per_minute,
        ctx.cooldown_minutes,
        info.tolerance * 100.0,
    );

    if !info.instruments.is_empty() {
        msg.push_str("<b>Sample Instruments:</b>\n");
        for instrument in info.instruments.iter().take(5) {
            let _ = writeln!(msg, "• {} ({})", escape(&instrument.name), escape(instrument.id.as_str()));
        }
        if info.instruments.len() > 5 {
            let _ = writeln!(msg, "• ... and {} more", info.instruments.len() - 5);
        }
    }

    msg.push_str("\n✅ <b>Bot is ready for monitoring!</b>");
    msg
}

/// One instrument with activity today.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub name: String,
    pub levels: SessionLevels,
    pub touches_today: u32,
    pub cooldown_remaining: Option<chrono::Duration>,
    pub pending: Vec<LevelKind>,
}

pub fn format_status_report(
    now: DateTime<Utc>,
    monitored: usize,
    entries: &[StatusEntry],
    ctx: &MessageContext,
) -> String {
    let mut msg = format!(
        "📊 <b>CPR Bot Status Report</b>\n\
         🕐 Time: {}\n\
         📈 Monitoring: {} instruments\n\
         ⏰ Cooldown: {} min\n\n",
        ctx.local_time(now),
        monitored,
        ctx.cooldown_minutes,
    );

    let mut active: Vec<&StatusEntry> = entries.iter().filter(|e| e.touches_today > 0).collect();
    if active.is_empty() {
        msg.push_str("📊 No level touches recorded today");
        return msg;
    }
    active.sort_by(|a, b| b.touches_today.cmp(&a.touches_today));

    msg.push_str("🎯 <b>Active Instruments Today:</b>\n");
    for entry in active {
        let levels = &entry.levels.levels;
        let _ = write!(
            msg,
            "<b>{}</b>\nS1={:.1} | P={:.1} | R1={:.1}\nTotal touches: {}\n",
            escape(&entry.name),
            levels.s1,
            levels.pivot,
            levels.r1,
            entry.touches_today,
        );
        match entry.cooldown_remaining {
            Some(remaining) => {
                let _ = writeln!(msg, "🔇 In cooldown: {}m left", remaining.num_minutes());
                if !entry.pending.is_empty() {
                    let _ = writeln!(msg, "Pending levels: {}", join_levels(&entry.pending));
                }
            }
            None => msg.push_str("✅ Ready for alerts\n"),
        }
        msg.push('\n');
    }
    msg.trim_end().to_string()
}
