//! Bounded retry with exponential backoff and a per-attempt deadline.

use crate::config::SyncConfig;
use crate::utils::errors::{EngineError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Runs `op` until it succeeds, fails permanently or attempts run out.
    /// Only transient errors (network, timeout, I/O) are retried. Every
    /// final failure is reported as `SyncFailed`.
    pub async fn run<T, F, Fut>(&self, destination: &str, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, self.attempt_timeout
                ))),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if err.is_transient() && attempt < self.max_attempts {
                warn!(
                    destination,
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.max_backoff);
                continue;
            }

            return Err(match err {
                EngineError::SyncFailed { .. } => err,
                other => EngineError::SyncFailed {
                    destination: destination.to_string(),
                    attempts: attempt,
                    reason: other.to_string(),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            attempt_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let value = policy(3, 1000)
            .run("nas", "put", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::Network("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_sync_failed() {
        let calls = AtomicU32::new(0);
        let err = policy(3, 1000)
            .run("nas", "put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::Network("unreachable".into()))
            })
            .await
            .unwrap_err();
        match err {
            EngineError::SyncFailed { destination, attempts, .. } => {
                assert_eq!(destination, "nas");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy(5, 1000)
            .run("offsite", "put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::Storage("403 Forbidden".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SyncFailed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let value = policy(2, 20)
            .run("slow", "get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
