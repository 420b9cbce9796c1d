//! Error types for the admission and caching layer

use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while admitting, caching or computing a request
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Caller exhausted its quota for the current window
    #[error("Quota exceeded for {identity}, retry after {}ms", retry_after.as_millis())]
    QuotaExceeded {
        identity: String,
        retry_after: Duration,
    },

    /// Shared store unreachable after retry
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    // =========================================================================
    // Compute Errors
    // =========================================================================
    /// Backend computation failed (never cached)
    #[error("Compute failed: {0}")]
    ComputeFailed(String),

    /// Leader lease expired while a follower was waiting; drives promotion
    #[error("Lease expired for {key}, retrying as leader")]
    LeaseExpiredRetry { key: String },

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Stored bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status a client should see for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ComputeFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the failure came from the shared store rather than the caller or backend.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Retry hint carried by quota rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
