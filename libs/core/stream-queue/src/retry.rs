//! Bounded retry for transient network failures
//!
//! Every Redis call the engine makes goes through [`RetryPolicy::run`].
//! Transient failures (timeouts, dropped or refused connections) are retried
//! with backoff, each attempt reported on the errors channel as
//! `Network { retrying: true }`. Anything else fails immediately.

use crate::backoff::Backoff;
use crate::error::{self, QueueError};
use redis::RedisResult;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) struct RetryPolicy<'a> {
    pub(crate) backoff: &'a Backoff,
    /// Maximum retries after the first attempt; negative means unlimited,
    /// zero means fail on the first transient error.
    pub(crate) max_retries: i64,
    /// Where `retrying: true` notifications go. `None` drops them.
    pub(crate) errors: Option<&'a mpsc::Sender<QueueError>>,
    pub(crate) shutdown: &'a CancellationToken,
}

impl RetryPolicy<'_> {
    pub(crate) async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let mut attempt: i64 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !error::is_transient(&err) {
                return Err(QueueError::from_redis(err));
            }
            if self.max_retries >= 0 && attempt >= self.max_retries {
                return Err(QueueError::Network {
                    source: err,
                    retrying: false,
                    backoff: None,
                });
            }

            let delay = self.backoff.for_attempt(attempt);
            warn!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient network error; retrying"
            );

            if let Some(errors) = self.errors {
                let notification = QueueError::Network {
                    source: err,
                    retrying: true,
                    backoff: Some(delay),
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(QueueError::Cancelled),
                    _ = errors.send(notification) => {}
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn transient() -> redis::RedisError {
        redis::RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0).with_jitter(false)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: 3,
            errors: None,
            shutdown: &shutdown,
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let result = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_transient_error() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: 0,
            errors: None,
            shutdown: &shutdown,
        };

        let result: Result<(), _> = policy.run(|| async { Err(transient()) }).await;
        match result {
            Err(QueueError::Network { retrying, .. }) => assert!(!retrying),
            other => panic!("expected exhausted network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_network_errors_are_not_retried() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: 5,
            errors: None,
            shutdown: &shutdown,
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<(), _> = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(redis::RedisError::from((
                        redis::ErrorKind::Extension,
                        "WRONGTYPE",
                    )))
                }
            })
            .await;

        assert!(matches!(result, Err(QueueError::Redis(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_retry_is_reported() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: 2,
            errors: Some(&tx),
            shutdown: &shutdown,
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let result = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(transient())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());

        let notification = rx.try_recv().unwrap();
        match notification {
            QueueError::Network { retrying, backoff, .. } => {
                assert!(retrying);
                assert!(backoff.is_some());
            }
            other => panic!("expected network notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_fails_before_the_first_attempt() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: 3,
            errors: None,
            shutdown: &shutdown,
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<(), _> = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(QueueError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation must not run");
    }

    #[tokio::test]
    async fn test_unlimited_retries_stop_on_cancellation() {
        let backoff = fast_backoff();
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let policy = RetryPolicy {
            backoff: &backoff,
            max_retries: -1,
            errors: None,
            shutdown: &shutdown,
        };
        let result: Result<(), _> = policy.run(|| async { Err(transient()) }).await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }
}
