//! Alert delivery with bounded retry.

use crate::config::DispatcherConfig;
use crate::telegram::{format_touch_alert, split_message, MessageContext};
use async_trait::async_trait;
use cpr_core::TouchAlert;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Transient delivery failure: {0}")]
    Transient(String),
    #[error("Delivery rejected: {0}")]
    Permanent(String),
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("Delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_) | DeliveryError::Timeout(_))
    }
}

/// Acknowledgement of a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Messages sent (long texts are split)
    pub messages: usize,
}

/// Outbound chat channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Longest text accepted by one `send`, in characters.
    fn max_message_len(&self) -> usize {
        usize::MAX
    }

    async fn send(&self, text: &str) -> Result<Delivered, DeliveryError>;
}

pub struct AlertDispatcher {
    channel: Arc<dyn NotificationChannel>,
    config: DispatcherConfig,
    context: MessageContext,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, config: DispatcherConfig, context: MessageContext) -> Self {
        Self {
            channel,
            config,
            context,
        }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// Format and deliver a touch alert.
    pub async fn dispatch(&self, alert: &TouchAlert) -> Result<Delivered, DeliveryError> {
        let text = format_touch_alert(alert, &self.context);
        let result = self.send_text(&text).await;
        match &result {
            Ok(_) => info!(
                instrument = %alert.event.instrument,
                level = %alert.event.level,
                touch_number = alert.touch_number,
                "Alert delivered"
            ),
            Err(e) => error!(
                instrument = %alert.event.instrument,
                level = %alert.event.level,
                error = %e,
                "Alert delivery failed"
            ),
        }
        result
    }

    /// Deliver arbitrary text, retrying transient failures with backoff.
    ///
    /// Text over the channel limit goes out as several messages. Each one is
    /// retried on its own, so a failure never repeats the parts already sent.
    pub async fn send_text(&self, text: &str) -> Result<Delivered, DeliveryError> {
        let chunks = split_message(text, self.channel.max_message_len());
        let mut messages = 0;
        for chunk in &chunks {
            messages += self.send_with_retry(chunk).await?.messages;
        }
        Ok(Delivered { messages })
    }

    async fn send_with_retry(&self, text: &str) -> Result<Delivered, DeliveryError> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.send_timeout, self.channel.send(text)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.config.send_timeout)),
            };

            let error = match result {
                Ok(delivered) => return Ok(delivered),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if !policy.should_retry(attempt) {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    last: error.to_string(),
                });
            }

            let delay = policy.calculate_delay_duration(attempt);
            warn!(
                channel = self.channel.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying delivery"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
