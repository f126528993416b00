//! Error types for the confluence service

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the confluence service
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Subscription errors
    #[error("Subscription cap reached for tenant {0}")]
    SubscriptionCap(String),

    #[error("Duplicate subscription: {tracker} already active for tenant {tenant}")]
    DuplicateSubscription { tracker: String, tenant: String },

    #[error("Subscription not found: {tracker} for tenant {tenant}")]
    SubscriptionNotFound { tracker: String, tenant: String },

    // Session errors
    #[error("Session connection failed: {0}")]
    SessionConnection(String),

    #[error("Session down: {0}")]
    SessionDown(String),

    #[error("Session decode error: {0}")]
    SessionDecode(String),

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Queue errors
    #[error("Queue job failed after {attempts} attempts: {reason}")]
    QueueFatal { attempts: u32, reason: String },

    #[error("Tenant queue not found: {0}")]
    TenantQueueNotFound(String),

    // Alert errors
    #[error("Alert send failed: {0}")]
    AlertSend(String),

    // Analyzer errors
    #[error("Price API error (status {status}): {message}")]
    PriceApi { status: u16, message: String },

    #[error("Price API rate limited")]
    AnalyzerRateLimited,

    #[error("Unknown or invalid token: {0}")]
    AnalyzerUnknownToken(String),

    #[error("Price API timeout after {0}ms")]
    PriceApiTimeout(u64),

    #[error("Invalid tenant settings: {0}")]
    InvalidSettings(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    ///
    /// The queue engine re-enqueues jobs only for retryable failures;
    /// everything else is counted as fatal on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_)
                | Error::StoreUnavailable(_)
                | Error::AlertSend(_)
                | Error::SessionConnection(_)
                | Error::AnalyzerRateLimited
                | Error::PriceApiTimeout(_)
                | Error::Io(_)
        ) || matches!(self, Error::PriceApi { status, .. } if *status >= 500)
    }

    /// Check if this error marks a permanently unknown token (4xx from the price API)
    pub fn is_unknown_token(&self) -> bool {
        matches!(self, Error::AnalyzerUnknownToken(_))
            || matches!(self, Error::PriceApi { status, .. } if (400..500).contains(status))
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::PriceApiTimeout(0)
        } else if let Some(status) = e.status() {
            Error::PriceApi {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Error::PriceApi {
                status: 0,
                message: e.to_string(),
            }
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
