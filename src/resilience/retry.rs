// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Every external call (shared cache, structured store, sheet API) runs
//! through one of these helpers. Attempts are bounded; an optional
//! per-attempt timeout turns a hung call into a retryable failure.
//!
//! # Example
//!
//! ```
//! use sheet_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let external = RetryConfig::external(Duration::from_secs(10), 3);
//! assert_eq!(external.max_retries, Some(3));
//! assert_eq!(external.attempt_timeout, Some(Duration::from_secs(10)));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::storage::traits::StorageError;

/// Configuration for connection/operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts allowed; `None` retries forever
    pub max_retries: Option<usize>,
    /// Upper bound for one attempt; `None` waits as long as the call takes
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// 5 attempts with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            attempt_timeout: None,
        }
    }

    /// Quick retry for individual cache queries.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            attempt_timeout: None,
        }
    }

    /// Bounded retry for store/sheet calls made while handling an event.
    /// Exhaustion fails the event, never the process.
    #[must_use]
    pub fn external(attempt_timeout: Duration, max_retries: usize) -> Self {
        Self {
            max_retries: Some(max_retries.max(1)),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            factor: 2.0,
            attempt_timeout: Some(attempt_timeout),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            attempt_timeout: Some(Duration::from_secs(1)),
        }
    }

    /// Delay before the attempt following `attempt` (1-based) failures.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay
    }
}

/// Retry every error until attempts run out.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, operation, |_| true).await
}

/// Retry only errors for which `should_retry` returns true; others return at once.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                    crate::metrics::record_retry_outcome(operation_name, "recovered");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    return Err(err);
                }
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        crate::metrics::record_retry_outcome(operation_name, "exhausted");
                        return Err(err);
                    }
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    "Operation failed, retrying in {:?}",
                    delay
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// Retry transient [`StorageError`]s, bounding each attempt by
/// `config.attempt_timeout`. A timed-out attempt counts as a transient failure.
pub async fn retry_storage<F, Fut, T>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let limit = config.attempt_timeout;
    retry_if(
        operation_name,
        config,
        || {
            let attempt = operation();
            async move {
                match limit {
                    Some(limit) => match timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => {
                            crate::metrics::record_timeout(operation_name);
                            Err(StorageError::Timeout(operation_name.to_string()))
                        }
                    },
                    None => attempt.await,
                }
            }
        },
        StorageError::is_transient,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_bounded_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_storage_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), StorageError> = retry_storage("decode", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Serialization("bad json".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Serialization(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out_and_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig {
            attempt_timeout: Some(Duration::from_millis(50)),
            ..RetryConfig::test()
        };

        let result: Result<u8, StorageError> = retry_storage("sheet_write", &config, || {
            let a = attempts_clone.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_secs(60)).await;
                }
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_backoff_and_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            factor: 2.0,
            max_retries: Some(5),
            attempt_timeout: None,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(350));
        assert_eq!(config.delay_for(4), Duration::from_millis(350));
    }

    #[test]
    fn test_external_preset_never_zero_attempts() {
        assert_eq!(RetryConfig::external(Duration::from_secs(1), 0).max_retries, Some(1));
    }
}
