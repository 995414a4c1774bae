//! Error types for fleet-dl
//!
//! This module provides error handling for the library:
//! - Domain-specific variants (FTP, dial-up, schedule, external operations)
//! - Context information (configuration key, device acronym, file path)
//! - `#[from]` conversions for collaborator error types

use thiserror::Error;

/// Result type alias for fleet-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fleet-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "connectionTimeout")
        key: Option<String>,
    },

    /// FTP protocol or connection error
    #[error("FTP error: {0}")]
    Ftp(String),

    /// Dial-up link establishment or teardown error
    #[error("dial-up error: {0}")]
    DialUp(String),

    /// Schedule expression parse or evaluation error
    #[error("schedule error: {0}")]
    Schedule(String),

    /// External operation launch or supervision error
    #[error("external operation error: {0}")]
    ExternalOperation(String),

    /// Network-share authentication error
    #[error("share authentication error: {0}")]
    ShareAuth(String),

    /// Notification dispatch error
    #[error("notification error: {0}")]
    Notify(String),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device, profile, or resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Construct a configuration error for a specific settings key.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
