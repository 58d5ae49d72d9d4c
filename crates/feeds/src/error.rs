//! Error types for feed operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to a market-data provider.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Provider error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data for {0}")]
    NoData(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout(err.to_string())
        } else if err.is_decode() {
            FeedError::ParseError(err.to_string())
        } else if let Some(status) = err.status() {
            FeedError::from_status(status.as_u16(), err.to_string())
        } else {
            FeedError::Network(err.to_string())
        }
    }
}

impl FeedError {
    /// Map an HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => FeedError::AuthenticationFailed(format!("HTTP {}: {}", status, message)),
            429 => FeedError::RateLimitExceeded,
            _ => FeedError::Http { status, message },
        }
    }

    /// Returns true if this error is transient and likely to succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Network(_) | FeedError::Timeout(_) | FeedError::RateLimitExceeded => true,
            FeedError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error needs manual intervention (credentials).
    /// The poller stops after repeated permanent failures.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FeedError::AuthenticationFailed(_))
    }

    /// Returns a suggested retry delay for this error type, if applicable.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            FeedError::RateLimitExceeded => Some(Duration::from_secs(60)),
            FeedError::Network(_) => Some(Duration::from_secs(5)),
            FeedError::Timeout(_) => Some(Duration::from_secs(2)),
            FeedError::Http { status, .. } if *status >= 500 => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(FeedError::from_status(401, "unauthorized").is_permanent());
        assert!(FeedError::from_status(403, "forbidden").is_permanent());
        assert!(FeedError::from_status(429, "slow down").is_transient());
        assert!(FeedError::from_status(503, "unavailable").is_transient());

        let not_found = FeedError::from_status(404, "missing");
        assert!(!not_found.is_transient());
        assert!(!not_found.is_permanent());
    }

    #[test]
    fn test_suggested_retry_delay() {
        assert_eq!(
            FeedError::RateLimitExceeded.suggested_retry_delay(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            FeedError::AuthenticationFailed("bad token".into()).suggested_retry_delay(),
            None
        );
        assert_eq!(FeedError::ParseError("x".into()).suggested_retry_delay(), None);
    }
}
