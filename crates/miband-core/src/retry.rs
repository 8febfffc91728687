//! Bounded retry with back-off.
//!
//! One combinator, [`with_retry`], serves every retry site of a refresh:
//! connect attempts, per-operation reads, and the whole-cycle restart. Each
//! site supplies its own [`RetryPolicy`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use miband_core::{LinkError, RetryPolicy, with_retry};
//!
//! # async fn example() -> Result<(), LinkError> {
//! let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
//!
//! let value = with_retry(&policy, "read_battery", || async {
//!     Ok::<_, LinkError>(42)
//! })
//! .await
//! .map_err(|failure| failure.error)?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{DeviceNotFoundReason, Error, LinkError, Result};

/// Classification of errors for [`with_retry`].
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for LinkError {
    fn is_retryable(&self) -> bool {
        match self {
            LinkError::Bluetooth(_) => true,
            LinkError::NotConnected => true,
            LinkError::Timeout { .. } => true,
            LinkError::DiscoveryFailed(_) => true,
            LinkError::ConnectionFailed(_) => true,
            // The band may be asleep or briefly out of range
            LinkError::DeviceNotFound(reason) => !matches!(reason, DeviceNotFoundReason::NoAdapter),
            LinkError::CharacteristicNotFound { .. } => false,
        }
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Link(e) => e.is_retryable(),
            Error::Decode(_) => false,
            Error::ConnectExhausted { .. } => false,
            Error::Cancelled => false,
            Error::InvalidConfig(_) => false,
        }
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (at least 1).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub delay: Duration,
    /// Back-off multiplier (1.0 = fixed delay).
    pub backoff_multiplier: f64,
    /// Upper bound for the back-off delay.
    pub max_delay: Duration,
    /// Whether to add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(3))
    }
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Connect attempts: the band needs a few seconds to become
    /// connectable again after a failed attempt.
    pub fn for_connect() -> Self {
        Self::fixed(3, Duration::from_secs(3))
    }

    /// Reads on an established link: short, few retries.
    pub fn for_read() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }

    /// Whole-cycle restarts after the link dropped.
    pub fn for_cycle() -> Self {
        Self::fixed(10, Duration::from_secs(3))
    }

    // ==================== Builder Methods ====================

    /// Set the total number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    /// Use exponential back-off up to `max_delay`.
    #[must_use]
    pub fn exponential(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Check the policy for nonsensical values.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be >= 1"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.max_delay < self.delay {
            return Err(Error::invalid_config("max_delay must be >= delay"));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// The last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error from the final attempt.
    pub error: E,
}

impl<E> RetryFailure<E> {
    /// Discard the attempt count.
    pub fn into_error(self) -> E {
        self.error
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
///
/// Back-off sleeps happen between attempts only, never after the last one.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation_name, attempt, max_attempts, error, delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use miband_types::DecodeError;

    #[test]
    fn test_fixed_policy_delay() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_policy_delay() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100))
            .exponential(2.0, Duration::from_millis(300));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1)).jitter(true);
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::fixed(0, Duration::ZERO).validate().is_err());
        assert!(
            RetryPolicy::fixed(3, Duration::from_secs(1))
                .exponential(0.5, Duration::from_secs(2))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(LinkError::NotConnected.is_retryable());
        assert!(LinkError::timeout("read", Duration::from_secs(1)).is_retryable());
        assert!(LinkError::device_not_found("x").is_retryable());
        assert!(!LinkError::DeviceNotFound(DeviceNotFoundReason::NoAdapter).is_retryable());

        assert!(Error::Link(LinkError::NotConnected).is_retryable());
        assert!(!Error::Decode(DecodeError::malformed(16, 3)).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(
            !Error::ConnectExhausted {
                attempts: 3,
                source: LinkError::NotConnected
            }
            .is_retryable()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_immediate_success() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let result = with_retry(&policy, "test", || async { Ok::<_, LinkError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_eventual_success() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(3));
        let attempts = Arc::new(AtomicU32::new(0));

        let result = with_retry(&policy, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LinkError::NotConnected)
                } else {
                    Ok(1)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_exhausts_exact_budget() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result: std::result::Result<(), _> = with_retry(&policy, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(LinkError::NotConnected)
            }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert!(matches!(failure.error, LinkError::NotConnected));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // Three back-offs between four attempts
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_non_retryable() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: std::result::Result<(), _> = with_retry(&policy, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Cancelled)
            }
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_zero_attempts_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let result: std::result::Result<(), _> =
            with_retry(&policy, "test", || async { Err(LinkError::NotConnected) }).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }
}
