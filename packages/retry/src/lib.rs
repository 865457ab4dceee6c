#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Retry helper for network calls to the key-value and object stores.
//!
//! Every remote call runs through [`RetryPolicy::run`], which bounds each
//! attempt with a timeout and retries errors that classify themselves as
//! [`Transient`] with exponential backoff.
//!
//! # Usage
//!
//! ```ignore
//! let body = policy
//!     .run("get tiles/0/1/2.png", || client.get(key))
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

/// Default number of attempts (the first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry; doubled on each further retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An attempt exceeded the policy's timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{label} timed out after {timeout:?}")]
pub struct TimeoutError {
    /// Description of the operation.
    pub label: String,
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// Classifies an error as worth retrying.
pub trait Transient {
    /// Returns `true` if the same call might succeed if repeated.
    fn is_transient(&self) -> bool;
}

/// Bounded exponential-backoff retry with a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): `base_delay * 2^(retry-1)`.
    #[must_use]
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` is called once per attempt to build a fresh future.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// error that is not [`Transient`]. A timed-out attempt becomes
    /// `E::from(TimeoutError)`.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + From<TimeoutError> + std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::from(TimeoutError {
                    label: label.to_string(),
                    timeout: self.timeout,
                })),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_before(attempt);
                    log::warn!(
                        "{label}: attempt {attempt}/{max_attempts} failed ({e}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        log::error!("{label}: giving up after {attempt} attempt(s): {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
        #[error(transparent)]
        Timeout(#[from] TimeoutError),
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky | Self::Timeout(_))
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_millis(500));
        assert_eq!(policy.delay_before(2), Duration::from_secs(1));
        assert_eq!(policy.delay_before(3), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, TestError> = fast(3)
            .run("flaky op", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(TestError::Flaky) } else { Ok(n) }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), TestError> = fast(2)
            .run("always flaky", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        assert!(matches!(result, Err(TestError::Flaky)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), TestError> = fast(5)
            .run("fatal op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };
        let result: Result<(), TestError> = policy
            .run("slow op", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(TestError::Timeout(_))));
    }
}
