//! Logging errors

use thiserror::Error;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// Filter directive could not be parsed
    #[error("invalid log filter `{directive}`: {reason}")]
    Filter { directive: String, reason: String },

    /// A global subscriber is already installed
    #[error("logger already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Result type for logging setup
pub type LogResult<T> = Result<T, LogError>;
