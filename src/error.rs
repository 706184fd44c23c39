//! Error types for thread reconstruction.

use thiserror::Error;

/// Result type alias for thread operations.
pub type Result<T> = std::result::Result<T, ThreadError>;

/// Main error type for thread reconstruction and board maintenance.
///
/// Most of these never escape a rebuild: per-record faults are logged and
/// skipped. They surface from configuration loading, engine construction
/// and direct calls into a [`RecordStore`](crate::store::RecordStore).
#[derive(Error, Debug)]
pub enum ThreadError {
    /// Record store read or write failures
    #[error("Store error: {0}")]
    Store(String),

    /// A record whose ancestry cannot be interpreted
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A rebuild was superseded by a newer request
    #[error("Rebuild cancelled")]
    Cancelled,

    /// Background worker errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl ThreadError {
    /// Creates a new store error.
    pub fn store<T: ToString>(msg: T) -> Self {
        Self::Store(msg.to_string())
    }

    /// Creates a new malformed record error.
    pub fn malformed<T: ToString>(msg: T) -> Self {
        Self::MalformedRecord(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new invalid input error.
    pub fn invalid_input<T: ToString>(msg: T) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    /// Creates a new scheduler error.
    pub fn scheduler<T: ToString>(msg: T) -> Self {
        Self::Scheduler(msg.to_string())
    }

    /// Returns true if this error only signals supersession.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for ThreadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
