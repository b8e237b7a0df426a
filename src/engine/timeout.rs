//! Execution Timeout Management
//!
//! Every execution has a finite bound. The caller's requested timeout is
//! resolved against a configured default and a ceiling; there is no way to
//! opt out of the ceiling.

use std::time::Duration;

/// Absolute ceiling no configuration may exceed (5 minutes)
pub const HARD_TIMEOUT_CEILING_SECS: u64 = 300;

/// Timeout applied when the caller does not specify one
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Resolves requested timeouts into effective bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    default: Duration,
    ceiling: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_SECS, HARD_TIMEOUT_CEILING_SECS)
    }
}

impl TimeoutPolicy {
    /// Create a policy from a default and a ceiling in seconds
    ///
    /// Both values are clamped into `1..=HARD_TIMEOUT_CEILING_SECS`, and the
    /// default never exceeds the ceiling.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use execguard::engine::TimeoutPolicy;
    ///
    /// let policy = TimeoutPolicy::new(30, 120);
    /// assert_eq!(policy.resolve(0), Duration::from_secs(30));
    /// assert_eq!(policy.resolve(600), Duration::from_secs(120));
    /// ```
    pub fn new(default_secs: u64, ceiling_secs: u64) -> Self {
        let ceiling = ceiling_secs.clamp(1, HARD_TIMEOUT_CEILING_SECS);
        let default = default_secs.clamp(1, ceiling);
        Self {
            default: Duration::from_secs(default),
            ceiling: Duration::from_secs(ceiling),
        }
    }

    /// Effective timeout for a requested value
    ///
    /// Non-positive requests mean "unset" and get the default.
    pub fn resolve(&self, requested_secs: i32) -> Duration {
        if requested_secs <= 0 {
            return self.default;
        }
        Duration::from_secs(requested_secs as u64).min(self.ceiling)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
