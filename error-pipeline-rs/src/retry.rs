//! # Retry Mechanism
//!
//! Bounded retries with exponential backoff and jitter, used by the
//! recovery manager to run `retry` actions.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Serialize, Deserialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::types::{Error, Result};

/// The result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T> {
    /// The operation succeeded
    Success { value: T, attempts: u32 },
    /// Every attempt failed; carries the last error
    Failure { error: Error, attempts: u32 },
}

impl<T> RetryResult<T> {
    /// Converts the result to a standard Result
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failure { error, .. } => Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success { .. })
    }

    /// Number of attempts made, including the successful one
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Failure { attempts, .. } => *attempts,
        }
    }
}

/// Configuration for a retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_backoff_ms: u64,
    /// Upper bound for a single delay
    pub max_backoff_ms: u64,
    /// Jitter factor (0.0 - 1.0) to add randomness to backoff
    pub jitter_factor: f64,
    /// Timeout applied to each attempt
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            jitter_factor: 0.1,
            attempt_timeout_ms: Some(30_000),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::InvalidConfig("retry.jitter_factor must be within 0.0..=1.0".into()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(Error::InvalidConfig("retry.base_backoff_ms exceeds retry.max_backoff_ms".into()));
        }
        Ok(())
    }
}

/// A retry policy that determines how to handle retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    /// Name of the policy (for logs)
    name: String,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: Option<RetryConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            name: name.into(),
        }
    }

    /// A policy that makes exactly one attempt
    pub fn never() -> Self {
        Self::new("never", Some(RetryConfig { max_attempts: 1, ..Default::default() }))
    }

    /// Overrides the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    /// Overrides the base backoff
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.config.base_backoff_ms = base.as_millis() as u64;
        self.config.max_backoff_ms = self.config.max_backoff_ms.max(self.config.base_backoff_ms);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry following the given zero-based attempt
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_backoff_ms as f64;
        let max_ms = self.config.max_backoff_ms as f64;

        let exp_backoff = base_ms * 2.0_f64.powi(attempt.min(30) as i32);
        let capped_backoff = exp_backoff.min(max_ms);

        // Jitter to avoid synchronized retries
        let jitter_range = capped_backoff * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped_backoff + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Runs `f` until it succeeds or the attempt budget is spent.
    ///
    /// `f` receives the zero-based attempt number.
    pub async fn retry<F, Fut, T>(&self, operation: &str, mut f: F) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = match self.config.attempt_timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), f(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Action(format!("'{}' timed out after {} ms", operation, ms))),
                },
                None => f(attempt).await,
            };
            attempt += 1;

            match result {
                Ok(value) => {
                    debug!(
                        policy = %self.name,
                        operation = %operation,
                        attempts = attempt,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Operation succeeded"
                    );
                    return RetryResult::Success { value, attempts: attempt };
                }
                Err(error) if attempt >= max_attempts => {
                    warn!(
                        policy = %self.name,
                        operation = %operation,
                        attempts = attempt,
                        error = %error,
                        "Retries exhausted"
                    );
                    return RetryResult::Failure { error, attempts: attempt };
                }
                Err(error) => {
                    let backoff = self.calculate_backoff(attempt - 1);
                    debug!(
                        policy = %self.name,
                        operation = %operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            Some(RetryConfig {
                max_attempts: attempts,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                jitter_factor: 0.0,
                attempt_timeout_ms: Some(1_000),
            }),
        )
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast(5)
            .retry("flaky", |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Action("not yet".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts(), 3);
        assert_eq!(result.into_result().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: RetryResult<()> = fast(3)
            .retry("always-fails", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Action("down".into())) }
            })
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy::new(
            "slow",
            Some(RetryConfig { max_attempts: 1, attempt_timeout_ms: Some(10), ..Default::default() }),
        );

        let result: RetryResult<()> = policy
            .retry("sleepy", |_| async {
                sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        match result {
            RetryResult::Failure { error, attempts } => {
                assert_eq!(attempts, 1);
                assert!(error.to_string().contains("timed out"));
            }
            RetryResult::Success { .. } => panic!("expected a timeout"),
        }
    }

    #[test]
    fn test_never_makes_a_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<()> = tokio_test::block_on(RetryPolicy::never().retry("once", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Action("nope".into())) }
        }));

        assert_eq!(result.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::new(
            "backoff",
            Some(RetryConfig {
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
                jitter_factor: 0.0,
                ..Default::default()
            }),
        );

        assert_eq!(policy.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(800));
        assert_eq!(policy.calculate_backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let backoff = policy.calculate_backoff(attempt);
            assert!(backoff <= Duration::from_millis(policy.config().max_backoff_ms));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryConfig { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert_eq!(RetryPolicy::never().config().max_attempts, 1);
    }
}
