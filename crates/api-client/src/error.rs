//! Error types for the artifact store client

use miette::Diagnostic;
use thiserror::Error;

/// Error type for artifact store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Transport-level HTTP failure (connect, timeout, TLS, body read)
    #[error("HTTP request failed: {source}")]
    #[diagnostic(
        code(relay::api::http),
        help("Check network connectivity and the configured artifact store endpoint")
    )]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// The store answered with a non-success status code
    #[error("artifact store returned HTTP {status} for {operation}")]
    #[diagnostic(code(relay::api::status))]
    UnexpectedStatus {
        /// HTTP status code returned by the store
        status: u16,
        /// Operation that received the status (e.g. "put_artifact")
        operation: String,
    },

    /// Client configuration error
    #[error("API client configuration error: {message}")]
    #[diagnostic(code(relay::api::config))]
    Configuration {
        /// Description of the configuration issue
        message: String,
    },

    /// All retry attempts for an operation failed
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(relay::api::retry_exhausted),
        help("The artifact store may be unavailable; builds continue without remote caching")
    )]
    RetryExhausted {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: usize,
        /// Message of the last error observed
        last_error: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an unexpected-status error
    #[must_use]
    pub fn unexpected_status(status: u16, operation: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            status,
            operation: operation.into(),
        }
    }

    /// Create a retry-exhausted error
    #[must_use]
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }
}

/// Result type for artifact store operations
pub type Result<T> = std::result::Result<T, Error>;
