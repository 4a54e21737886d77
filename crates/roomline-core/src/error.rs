use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for retry decisions and caller-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unknown operation, or other configuration issue.
    Config,
    /// Authentication failure (expired or missing credentials).
    Auth,
    /// The server understood the request but refuses to authorize it.
    Forbidden,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// The operation was cancelled via its cancellation signal.
    Cancelled,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload shared by every roomline component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds, from a 429 response.
    pub retry_after_ms: Option<u64>,
}

impl ClientError {
    /// Construct a new error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build the standard cancellation error.
    pub fn cancelled(action: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Cancelled,
            "cancelled",
            format!("{} was cancelled", action.into()),
        )
    }

    /// Whether a retry loop may recover from this error by waiting.
    ///
    /// Auth counts as recoverable: the session may heal once the user
    /// re-authenticates externally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network
                | ErrorCategory::RateLimited
                | ErrorCategory::Auth
                | ErrorCategory::Internal
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 => ErrorCategory::Auth,
        403 => ErrorCategory::Forbidden,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}
