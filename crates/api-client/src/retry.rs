//! Retry logic with exponential backoff for artifact store requests

use crate::error::{Error, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry a fallible async operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts = attempts,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempts,
                        error = %err,
                        "Operation failed after maximum retries"
                    );
                    return Err(Error::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }

                if !is_retryable(&err) {
                    debug!(
                        operation = operation_name,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation_name,
                        attempts = attempts,
                        error = %err,
                        retry_in_ms = duration.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(Error::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }
            }
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // We use max_attempts instead
        .build()
}

/// Determine if an error is retryable
fn is_retryable(err: &Error) -> bool {
    match err {
        // Connection resets and timeouts are transient
        Error::Http { source } => {
            source.is_timeout() || source.is_connect() || source.is_request()
        }

        // Rate limiting and server-side failures are retryable; 501 means the
        // store will never implement the method, so retrying is pointless
        Error::UnexpectedStatus { status, .. } => {
            *status == 429 || (*status >= 500 && *status != 501)
        }

        // These errors are NOT retryable
        Error::Configuration { .. } => false,
        Error::RetryExhausted { .. } => false,
    }
}
