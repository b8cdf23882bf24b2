//! Error types for vncdesk

use thiserror::Error;

/// Result type alias using vncdesk Error
pub type Result<T> = std::result::Result<T, Error>;

/// vncdesk error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} {id} is not usable: {reason}")]
    InvalidState {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("Installation key already used")]
    KeyAlreadyUsed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Target {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn invalid_state(kind: &str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            kind: kind.to_string(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of the backing store rather than of the request.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Serialization(_))
    }
}
