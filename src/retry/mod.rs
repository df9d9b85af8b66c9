//! Retry with backoff for transient AWS failures
//!
//! Used by the producer for publish attempts and by the DynamoDB lease
//! store for reads and lease writes. Callers bound the total time spent
//! retrying themselves (e.g. with `tokio::time::timeout`).

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None retries until the caller gives up)
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Retries without an attempt limit
    pub fn unbounded(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries: None,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff)
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Runs `operation` until it succeeds or the attempt limit is hit
    pub async fn retry<F, Fut, T, E>(&mut self, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            match operation().await {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    if let Some(max) = self.config.max_retries {
                        if self.attempts >= max {
                            warn!(
                                attempts = self.attempts,
                                error = %e,
                                "Maximum retry attempts exceeded"
                            );
                            return Err(RetryError::MaxRetriesExceeded(self.attempts, e.to_string()));
                        }
                    }

                    let delay = self.backoff.next_delay(self.attempts);
                    warn!(
                        attempt = self.attempts,
                        delay_ms = ?delay.as_millis(),
                        error = %e,
                        "Operation failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn handle(config: RetryConfig) -> RetryHandle<ExponentialBackoff> {
        let backoff = config.backoff();
        RetryHandle::new(config, backoff)
    }

    #[tokio::test]
    async fn test_retry_success() -> anyhow::Result<()> {
        let mut retry = handle(RetryConfig {
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        });

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry
            .retry(|| {
                let value = counter_clone.clone();
                async move {
                    let attempts = value.fetch_add(1, Ordering::SeqCst);
                    if attempts < 2 {
                        Err("not yet")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await?;

        assert_eq!(result, "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_max_attempts() -> anyhow::Result<()> {
        let mut retry = handle(RetryConfig {
            max_retries: Some(2),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        });

        let result: Result<(), _> = retry.retry(|| async { Err("always fails") }).await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded(2, _))));
        assert!(result.unwrap_err().is_max_retries());

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_is_cut_by_timeout() -> anyhow::Result<()> {
        let mut retry = handle(RetryConfig::unbounded(
            Duration::from_millis(100),
            Duration::from_millis(500),
        ));

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            retry.retry(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("unreachable")
                }
            }),
        )
        .await;

        assert!(result.is_err());
        assert!(attempts.load(Ordering::SeqCst) > 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() -> anyhow::Result<()> {
        let mut retry = handle(RetryConfig {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        });

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let start = tokio::time::Instant::now();

        retry
            .retry(|| {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not ready")
                    } else {
                        Ok(())
                    }
                }
            })
            .await?;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(20));
        Ok(())
    }
}
