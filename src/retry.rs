//! Bounded exponential backoff.
//!
//! The environment server inside a freshly started container needs some time before it accepts
//! connections. [`retry`] keeps calling a fallible operation, sleeping a growing interval between
//! failures, until it succeeds or the [`RetryPolicy`] budget (attempt count and total elapsed
//! time) is exhausted.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sphere_env::retry::{retry, RetryPolicy};
//!
//! let policy = RetryPolicy::new()
//!     .with_initial_interval(Duration::from_millis(1))
//!     .with_max_attempts(5);
//! let value = retry(&policy, |attempt| {
//!     if attempt < 3 {
//!         anyhow::bail!("not ready")
//!     }
//!     Ok(attempt)
//! })
//! .unwrap();
//! assert_eq!(value, 3);
//! ```

use std::env;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

/// Budget and pacing of a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_attempts: u32,
    max_elapsed: Duration,
}

impl RetryPolicy {
    /// Creates a policy waiting 500ms after the first failure, then 1.5 times longer after each
    /// failure (at most 5s), for up to 20 attempts or 60s.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(5),
            max_attempts: 20,
            max_elapsed: Duration::from_secs(60),
        }
    }

    /// Creates a policy from environment variables, keeping defaults for unset ones.
    ///
    /// Read environment variables are:
    /// - `SPHERE_RETRY_MAX_ATTEMPTS` (u32): maximum number of attempts
    /// - `SPHERE_RETRY_MAX_ELAPSED_SECS` (u64): time after which no new attempt is started
    /// - `SPHERE_RETRY_INITIAL_MS` (u64): wait after the first failure in milliseconds
    /// - `SPHERE_RETRY_MAX_INTERVAL_MS` (u64): upper bound of a single wait in milliseconds
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_u64(var: &str) -> Option<u64> {
            env::var(var).ok()?.parse().ok()
        }

        let mut policy = Self::new();
        if let Some(attempts) = parse_u64("SPHERE_RETRY_MAX_ATTEMPTS") {
            policy = policy.with_max_attempts(u32::try_from(attempts).unwrap_or(u32::MAX));
        }
        if let Some(secs) = parse_u64("SPHERE_RETRY_MAX_ELAPSED_SECS") {
            policy = policy.with_max_elapsed(Duration::from_secs(secs));
        }
        if let Some(ms) = parse_u64("SPHERE_RETRY_INITIAL_MS") {
            policy = policy.with_initial_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_u64("SPHERE_RETRY_MAX_INTERVAL_MS") {
            policy = policy.with_max_interval(Duration::from_millis(ms));
        }
        policy
    }

    /// Wait after the first failure.
    #[must_use]
    pub fn with_initial_interval(mut self, value: Duration) -> Self {
        self.initial_interval = value;
        self
    }

    /// Growth factor of the wait between two attempts. Values below 1 are treated as 1.
    #[must_use]
    pub fn with_multiplier(mut self, value: f64) -> Self {
        self.multiplier = value.max(1.0);
        self
    }

    /// Upper bound of a single wait, however many attempts failed.
    #[must_use]
    pub fn with_max_interval(mut self, value: Duration) -> Self {
        self.max_interval = value;
        self
    }

    /// Maximum number of attempts, at least one.
    #[must_use]
    pub fn with_max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value.max(1);
        self
    }

    /// No attempt is started once this much time has passed since the first one.
    #[must_use]
    pub fn with_max_elapsed(mut self, value: Duration) -> Self {
        self.max_elapsed = value;
        self
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// The retry budget ran out. Holds the error of the last attempt.
#[derive(Error, Debug)]
#[error("gave up after {attempts} attempt(s)")]
pub struct RetryError {
    /// Number of attempts made.
    pub attempts: u32,
    /// Error of the last attempt.
    #[source]
    pub last: anyhow::Error,
}

/// Call `op` until it succeeds or `policy` is exhausted.
///
/// `op` receives the attempt number, starting at 1.
pub fn retry<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> anyhow::Result<T>,
{
    let start = Instant::now();
    let mut interval = policy.initial_interval.min(policy.max_interval);
    let mut attempt = 0;
    loop {
        attempt += 1;
        trace!(attempt, "trying");
        let last = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        debug!(attempt, "attempt failed: {last:#}");

        let out_of_time = start.elapsed() + interval > policy.max_elapsed;
        if attempt >= policy.max_attempts || out_of_time {
            return Err(RetryError {
                attempts: attempt,
                last,
            });
        }
        std::thread::sleep(interval);
        interval = policy.next_interval(interval);
    }
}
