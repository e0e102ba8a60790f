//! Error types for the auth service

use std::io;

use thiserror::Error;

/// Result type alias for the auth service
pub type Result<T> = std::result::Result<T, Error>;

/// Auth service errors
///
/// The taxonomy mirrors what the reply envelope exposes: adapters surface
/// typed errors upward, the dispatcher flattens them into a short
/// user-facing string. `Retryable` exists so the HTTP layer can classify
/// transient transport failures; it renders as an unexpected error at the
/// reply boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or missing required field
    #[error("validation failed: {0}")]
    Validation(String),

    /// Bad, missing, or expired token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token lacks a required scope
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// User does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Email already in use
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient transport failure against an external provider
    #[error("retryable error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Retryable {
        /// Remote status code, when one was available
        status: Option<u16>,
        /// Description of the failure
        message: String,
    },

    /// Network, remote 5xx, or unclassified failure
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Whether the operation may succeed if repeated.
    ///
    /// Application code never retries; this only informs the underlying
    /// HTTP client and log severity.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Short user-facing string for the reply envelope.
    ///
    /// The full chain is logged separately; replies never carry remote
    /// bodies or addresses.
    #[must_use]
    pub fn reply_message(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg) => msg.clone(),
            Self::Retryable { .. } | Self::Unexpected(_) => "internal error".to_string(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Unexpected(format!("io: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Retryable {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        } else {
            Self::Unexpected(format!("http: {e}"))
        }
    }
}
