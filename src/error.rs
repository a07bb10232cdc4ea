//! Error types for mail-sentinel.

use std::time::Duration;

/// Top-level error type for the monitor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mail backend errors, split by whether a later retry can help.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Network hiccup, rate limit, server error — retry on a later poll.
    #[error("Transient backend error on account {account}: {reason}")]
    Transient { account: String, reason: String },

    /// Auth revoked, folder missing — needs operator intervention.
    #[error("Permanent backend error on account {account}: {reason}")]
    Permanent { account: String, reason: String },
}

impl BackendError {
    pub fn transient(account: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            account: account.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(account: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            account: account.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Classification oracle errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Oracle request failed: {0}")]
    RequestFailed(String),

    #[error("Oracle timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Malformed verdict from oracle: {0}")]
    MalformedResponse(String),
}

/// Notification transport errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to send via {transport}: {reason}")]
    SendFailed { transport: String, reason: String },

    #[error("Invalid destination for {transport}: {reason}")]
    BadDestination { transport: String, reason: String },
}

/// Ledger store errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Result type alias for the monitor.
pub type Result<T> = std::result::Result<T, Error>;
