//! Common error type used throughout the taxi backend.
//!
//! Driver failures are carried as the boxed source of [`Error::Database`]
//! so callers can still inspect the underlying SQLite error.

/// Unified error type for the taxi backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided (malformed URL, bad definition, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying driver or pool error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new Conflict error.
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a new Database error from a driver error or a message.
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true if this is a database error.
    pub fn is_database(&self) -> bool {
        matches!(self, Error::Database { .. })
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
