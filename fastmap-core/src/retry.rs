//! Bounded retry and polling policy.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How often and for how long to retry a transient operation.
///
/// An operation is retried every `interval_ms` until it succeeds, until
/// `timeout_ms` has elapsed since the first attempt, or until
/// `max_attempts` attempts have been made, whichever comes first.
/// `max_attempts = 0` means the attempt count is unbounded and only the
/// timeout applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_ms: 10_000,
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            max_attempts: 0,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether another attempt is allowed after `attempts` attempts that
    /// started at `started`.
    #[must_use]
    pub fn allows(&self, attempts: u32, started: Instant) -> bool {
        if self.max_attempts > 0 && attempts >= self.max_attempts {
            return false;
        }
        started.elapsed() < self.timeout()
    }

    /// Runs `op` until it succeeds or the policy is exhausted, blocking the
    /// current thread between attempts.
    ///
    /// `retryable` decides whether an error is transient. A non-transient
    /// error is returned at once; after exhaustion the last error is
    /// returned together with the number of attempts made.
    ///
    /// # Errors
    /// Returns `(error, attempts)` for the final failed attempt.
    pub fn run_blocking<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, (E, u32)> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) || !self.allows(attempts, started) => {
                    return Err((e, attempts));
                }
                Err(_) => std::thread::sleep(self.interval()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_blocking_succeeds_after_retries() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(5));
        let mut calls = 0;
        let result: Result<u32, (&str, u32)> = policy.run_blocking(
            || {
                calls += 1;
                if calls < 3 {
                    Err("not yet")
                } else {
                    Ok(calls)
                }
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_run_blocking_respects_max_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
            .with_max_attempts(4);
        let result: Result<(), (&str, u32)> = policy.run_blocking(|| Err("never"), |_| true);
        assert_eq!(result.unwrap_err(), ("never", 4));
    }

    #[test]
    fn test_run_blocking_stops_on_fatal_error() {
        let policy = RetryPolicy::default();
        let result: Result<(), (&str, u32)> = policy.run_blocking(|| Err("fatal"), |_| false);
        assert_eq!(result.unwrap_err().1, 1);
    }
}
