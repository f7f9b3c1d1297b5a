//! Error types for Herald gateway

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Herald operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Herald gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound payload failed validation at the ingestion boundary
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Outbound channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Pipeline state change that the state machine does not allow
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: crate::pipeline::PipelineState,
        to: crate::pipeline::PipelineState,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error (pool checkout, corrupt rows)
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error came from the storage layer
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Sqlite(_))
    }
}

/// Failure taxonomy used by the pipeline to decide what happens next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The event was already recorded; benign, never surfaced as an error
    DuplicateIgnored,
    /// Upstream outage or rate limit; retried with backoff
    TransientUpstream,
    /// Permanent rejection; the message goes straight to `FAILED`
    NonRetryable,
    /// Storage failure; fatal for the current task
    PersistenceFailure,
}

impl ErrorKind {
    /// Stable identifier stored in `delivery_attempts.error_kind`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateIgnored => "duplicate_ignored",
            Self::TransientUpstream => "transient_upstream",
            Self::NonRetryable => "non_retryable",
            Self::PersistenceFailure => "persistence_failure",
        }
    }
}

/// Adapter errors that know whether another attempt could succeed
pub trait Retryable: std::error::Error {
    /// Whether the failure is transient and worth retrying
    fn is_transient(&self) -> bool;

    /// Upstream hint for how long to wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Classify the failure for the pipeline
    fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientUpstream
        } else {
            ErrorKind::NonRetryable
        }
    }
}
