//! Retry with Exponential Backoff
//!
//! The retry schedule is an explicit state machine ([`Backoff`]) so that it
//! can be tested without any I/O; [`retry_with_backoff`] drives it around an
//! async operation.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use execguard::client::retry::{Backoff, RetryConfig};
//!
//! let config = RetryConfig::new()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .jitter(0.0);
//!
//! let mut backoff = Backoff::new(config);
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
//! assert_eq!(backoff.next_delay(), None);
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Longest single retry delay a configuration may ask for
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Retry configuration
///
/// # Fields
///
/// * `max_attempts` - Maximum number of attempts, including the first (default: 3)
/// * `base_delay` - Delay before the first retry (default: 100ms)
/// * `max_delay` - Cap on any single delay (default: 5s)
/// * `jitter` - Random variation factor (default: 0.1 = ±10%)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0); spreads out clients retrying at the same time
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts (at least one is always made)
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `base_delay * 2^retry`, varied by up to ±`jitter`, capped at `max_delay`.
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let factor = 2_u32.checked_pow(retry).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter.is_nan() || self.jitter <= 0.0 {
            return exponential;
        }

        let offset = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter.min(1.0);
        Duration::try_from_secs_f64(exponential.as_secs_f64() * (1.0 + offset))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Reject values that would make the delay schedule meaningless
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("jitter must be within 0.0..=1.0, got {}", self.jitter));
        }
        if self.max_delay > MAX_RETRY_DELAY {
            return Err(format!(
                "max_delay must be <= {}ms",
                MAX_RETRY_DELAY.as_millis()
            ));
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// Attempt counter and delay schedule for one logical call
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt
    ///
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.config.max_attempts.max(1) {
            return None;
        }
        Some(self.config.calculate_delay(self.failures - 1))
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.config.max_attempts.max(1)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Why [`retry_with_backoff`] gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error that must not be retried
    Permanent(E),

    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent
///
/// `operation` receives the 0-based attempt number. Only errors for which
/// `is_retryable` returns true are retried.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        let attempt = backoff.failures();
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Call succeeded on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!("Attempt {} failed permanently: {}", attempt + 1, e);
                return Err(RetryError::Permanent(e));
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "Attempt {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                None => {
                    tracing::error!("Giving up after {} attempts: {}", attempt + 1, e);
                    return Err(RetryError::Exhausted {
                        attempts: backoff.failures(),
                        last: e,
                    });
                }
            },
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
