//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. The scheduling hot path never returns
//! these: addressing failures there are `None`, delivery failures are logged
//! and the payload dropped. `Error` is what the typed control surface, the
//! configuration loader and the harbor networking layer report.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Skiff kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command, argument or name.
    #[error("validation error: {0}")]
    Validation(String),

    /// Handle, name, module or environment key not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Address space or table exhausted (fatal misconfiguration).
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// A message could not be delivered (target retired, node unreachable).
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Harbor wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors (service init failure, worker fault).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code, used when the control surface reports a failure.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Capacity(_) => "RESOURCE_EXHAUSTED",
            Error::Delivery(_) => "UNAVAILABLE",
            Error::Protocol(_) => "PROTOCOL",
            Error::Config(_) => "FAILED_PRECONDITION",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "UNAVAILABLE",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
