//! Retry logic with exponential backoff for remote-tier operations

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use buildstash_core::config::RetryConfig;
use buildstash_core::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry a fallible async operation with exponential backoff.
///
/// Only errors whose [`Error::is_retryable`] is true are retried; everything
/// else surfaces immediately. Exhausting the attempt budget yields
/// [`Error::RetryExhausted`].
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
                        attempts, "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    debug!(
                        operation = operation_name,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "Operation failed after maximum retries"
                    );
                    return Err(Error::retry_exhausted(operation_name, attempts));
                }

                if let Some(duration) = backoff.next_backoff() {
                    debug!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        retry_in_ms = duration.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(Error::retry_exhausted(operation_name, attempts));
                }
            }
        }
    }
}

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // max_attempts bounds the loop
        .build()
}
