//! Error types for the channel-coords library.
//!
//! Every fallible operation in the library returns [`Result`], built on the
//! [`Error`] enum below. The variants follow how a failure propagates:
//! transient source failures are retried, malformed records are skipped and
//! counted, and store failures abort the enclosing transaction.

use thiserror::Error;

/// Errors that can occur while ingesting, storing or syncing messages.
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors (a failure inside a transaction rolls it back)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Network or timeout failure against the message source; worth retrying
    #[error("Transient source error: {0}")]
    TransientSource(String),

    /// Permanent failure reported by the message source
    #[error("Source error: {0}")]
    Source(String),

    /// A single message or row could not be interpreted
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Rejected input, snapshot or file type; raised before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV writer errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// General error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns `true` for errors that are worth retrying after a back-off delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource(_))
    }

    /// Short, stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Pool(_) => "pool",
            Self::TransientSource(_) => "transient_source",
            Self::Source(_) => "source",
            Self::MalformedRecord(_) => "malformed_record",
            Self::Validation(_) => "validation",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Csv(_) => "csv",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "other",
        }
    }
}

/// Convenience type alias for Result with [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
