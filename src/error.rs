//! Error types for the token broker

use std::io;

use thiserror::Error;

/// Result type alias for the token broker
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors (startup, configuration, I/O).
///
/// Per-request pipeline failures use [`crate::exchange::ExchangeError`]
/// and never escalate to this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
