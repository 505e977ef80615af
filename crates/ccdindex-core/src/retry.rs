//! Fixed-delay retry policy for transient storage failures.
//!
//! Wraps a unit of work and re-runs it while it fails with an error for which
//! [`ImportError::is_transient`] holds. The wrapped closure is invoked again
//! from scratch on every attempt, so it must only make its writes visible in a
//! single final commit.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::error;

use crate::error::ImportError;

/// Retry configuration as it appears in the job config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt; `-1` retries forever.
    #[serde(default = "default_retry_count")]
    pub retry_count: i64,
    /// Fixed wait between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_count() -> i64 {
    -1
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// How many times a failed unit of work may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Forever,
    Attempts(u32),
}

/// Retry policy with a fixed delay and no jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    limit: RetryLimit,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: RetryLimit, delay: Duration) -> Self {
        Self { limit, delay }
    }

    /// Build a policy from config. `retry_count` below `-1` is rejected.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ImportError> {
        let limit = match config.retry_count {
            -1 => RetryLimit::Forever,
            n if n >= 0 => RetryLimit::Attempts(u32::try_from(n).unwrap_or(u32::MAX)),
            n => {
                return Err(ImportError::Config(format!(
                    "retry_count must be -1 or non-negative, got {n}"
                )))
            }
        };
        Ok(Self::new(limit, Duration::from_millis(config.retry_delay_ms)))
    }

    pub fn limit(&self) -> RetryLimit {
        self.limit
    }

    /// Run `work` until it succeeds, fails with a non-transient error, or the
    /// retry budget is exhausted. The last error is returned in the latter cases.
    pub async fn execute<T, F, Fut>(&self, operation: &str, work: F) -> Result<T, ImportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ImportError>>,
    {
        let strategy: Box<dyn Iterator<Item = Duration> + Send> = match self.limit {
            RetryLimit::Forever => Box::new(FixedInterval::new(self.delay)),
            RetryLimit::Attempts(n) => Box::new(FixedInterval::new(self.delay).take(n as usize)),
        };

        let mut failures = 0u64;
        RetryIf::spawn(strategy, work, |err: &ImportError| {
            if !err.is_transient() {
                return false;
            }
            failures += 1;
            error!(
                operation,
                attempt = failures,
                error = %err,
                "Triggering retry policy due to transient error"
            );
            true
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(limit: RetryLimit) -> RetryPolicy {
        RetryPolicy::new(limit, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = policy(RetryLimit::Forever)
            .execute("test", move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(ImportError::transient("connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn bounded_retries_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = policy(RetryLimit::Attempts(2))
            .execute("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ImportError::transient("timeout"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        // first attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = policy(RetryLimit::Forever)
            .execute("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ImportError::MissingSender {
                        transaction_hash: "aa".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(ImportError::MissingSender { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_config_limits() {
        let forever = RetryPolicy::from_config(&RetryConfig::default()).unwrap();
        assert_eq!(forever.limit(), RetryLimit::Forever);

        let bounded = RetryPolicy::from_config(&RetryConfig {
            retry_count: 4,
            retry_delay_ms: 10,
        })
        .unwrap();
        assert_eq!(bounded.limit(), RetryLimit::Attempts(4));

        assert!(RetryPolicy::from_config(&RetryConfig {
            retry_count: -2,
            retry_delay_ms: 10,
        })
        .is_err());
    }
}
