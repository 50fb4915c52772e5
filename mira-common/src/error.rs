//! Common error types for MIRA

use thiserror::Error;

/// Common result type for MIRA operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the MIRA services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted document in a format this version does not support
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Target study cannot be mutated in its current state
    #[error("Study {study_instance_uid} is in an invalid state: {reason}")]
    InvalidState {
        study_instance_uid: String,
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures an operator must resolve (retrying will not help).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat(_) | Error::InvalidState { .. } | Error::Config(_)
        )
    }
}
