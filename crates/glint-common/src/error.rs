//! Common error types for Glint.

use thiserror::Error;

/// Result type alias using Glint's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Glint operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Relay (TURN) error
    #[error("relay error: {0}")]
    Relay(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a relay error from any displayable type.
    pub fn relay(msg: impl std::fmt::Display) -> Self {
        Self::Relay(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
