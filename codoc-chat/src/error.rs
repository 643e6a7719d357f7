//! Error type for conversation engine operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Error type for the chat API client and stream setup.
#[derive(Error, Debug)]
pub enum ChatError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Server returned a non-success status
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Failed to parse a response body
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Global rate limit (HTTP 429 on an ordinary request)
    #[error("Rate limited until {}", retry_at.map_or_else(|| "further notice".to_string(), |at| at.to_rfc3339()))]
    RateLimited { retry_at: Option<DateTime<Utc>> },

    /// Conversation-scoped rate limit on the chat stream
    #[error("Chat stream rate limited (retry after {retry_after_secs:?}s)")]
    StreamRateLimited { retry_after_secs: Option<u64> },

    /// Send-turn response accepted the message but carried no conversation id
    #[error("Send-turn response carried no conversation id")]
    MissingConversationId,
}

impl ChatError {
    /// Whether this error belongs to either rate-limit channel.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::StreamRateLimited { .. })
    }

    /// HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::RateLimited { .. } | Self::StreamRateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// Result type for chat operations.
pub type Result<T> = std::result::Result<T, ChatError>;
