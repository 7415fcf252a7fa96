//! Retry with exponential backoff for remote storage calls.
//!
//! Only errors that [`StorageError::is_retryable`] accepts are retried;
//! everything else fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::storage::StorageError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// All retries exhausted, or the error was permanent.
    Exhausted {
        /// The last error that occurred.
        last_error: StorageError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Collapse into a plain result carrying the last error
    pub fn into_result(self) -> Result<T, StorageError> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    pub async fn execute<F, Fut, T>(&self, what: &str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !e.is_retryable() || attempt > self.config.max_retries {
                        if attempt > 1 {
                            warn!(what, attempts = attempt, error = %e, "giving up after retries");
                        }
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    debug!(what, attempt, ?backoff, error = %e, "retrying storage call");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// `initial_backoff * multiplier^attempt`, capped at `max_backoff`,
    /// plus up to 50% jitter when enabled.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;
        let computed = base_delay_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_ms) as u64;

        if self.config.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..capped / 2 + 1);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}
