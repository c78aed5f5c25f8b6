//! Error types for the cache crate

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(relay::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(relay::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(relay::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Remote artifact store failure
    ///
    /// Only surfaces from the api-client seam; backend implementations
    /// downgrade it to a miss before it reaches the scheduler.
    #[error("Remote artifact store error: {message}")]
    #[diagnostic(
        code(relay::cache::remote),
        help("Remote caching degrades to local-only when the store is unreachable")
    )]
    Remote {
        /// Description of the remote failure
        message: String,
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

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a remote store error
    #[must_use]
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote {
            message: msg.into(),
        }
    }
}

impl From<relay_api_client::Error> for Error {
    fn from(err: relay_api_client::Error) -> Self {
        Self::remote(err.to_string())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
