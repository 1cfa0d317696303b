//! Retry with exponential backoff.
//!
//! Used by the step runner to re-attempt failed steps. An operation is
//! retried according to a [`RetryPolicy`] until it succeeds or runs out of
//! attempts.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fieldsweep_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::default();
//!
//! let result = with_retry(&policy, || async {
//!     store.exists(&urn).await
//! }).await;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 100ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as percentage (default: 0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Policy for an upgrade step declaring `retry_count` extra attempts.
    #[must_use]
    pub fn for_step(retry_count: u32, base: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(base.initial_delay_ms),
            Duration::from_millis(base.max_delay_ms),
            base.backoff_factor,
            base.jitter_percent,
            retry_count.saturating_add(1),
        )
    }

    /// No delay between attempts. Tests only need the attempt count.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0, 0.0, max_attempts)
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Backoff tuning loaded from the `[retry]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per step, the first one included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_percent: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry and exponential backoff.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = tokio::time::Instant::now();
    let max = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if attempt >= max {
                    warn!(
                        attempt,
                        max_attempts = max,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn new_clamps_inputs() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, 0.5, 3.0, 0);
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!((policy.jitter_percent - 1.0).abs() < f64::EPSILON);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn for_step_adds_initial_attempt() {
        let policy = RetryPolicy::for_step(2, &RetrySettings::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(RetryPolicy::for_step(0, &RetrySettings::default()).max_attempts, 1);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
            0.0,
            10,
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_secs(10),
            2.0,
            0.1,
            5,
        );
        for _ in 0..50 {
            let ms = policy.delay_for_attempt(0).as_millis();
            assert!((900..=1100).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = with_retry_outcome(&RetryPolicy::immediate(3), || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("transient") } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(outcome.result, Ok(2));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), &str> = with_retry(&RetryPolicy::immediate(2), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down")
            }
        })
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            0.0,
            3,
        );
        let outcome: RetryOutcome<(), &str> =
            with_retry_outcome(&policy, || async { Err("x") }).await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed >= Duration::from_millis(300));
    }
}
