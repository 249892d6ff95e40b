//! Error types for callpulse-core

use thiserror::Error;

/// Main error type for the callpulse-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Event is missing a required field or carries an unusable value
    #[error("invalid event: {field}: {message}")]
    InvalidEvent { field: String, message: String },

    /// Notification channel error
    #[error("notification error: {0}")]
    Notification(String),

    /// Aggregate store error that is not a plain SQLite failure
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidEvent`].
    pub fn invalid_event(field: &str, message: impl Into<String>) -> Self {
        Error::InvalidEvent {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for callpulse-core
pub type Result<T> = std::result::Result<T, Error>;
