//! Backoff for transient provider errors

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// How often and how patiently a provider call is repeated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Upper bound on provider calls, the first one included
    pub max_attempts: u32,
    /// Pause after the first failure
    pub base_delay: Duration,
    /// Growth of the pause per failure
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Single attempt, errors surface immediately
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Pause after the `failures`-th consecutive failure (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        }
    }
}

/// Run `operation` until it succeeds, fails terminally or runs out of attempts
///
/// `retryable` decides whether an error is worth another call. The last error
/// is returned when the attempts are used up.
pub fn with_retry<T, E, C, F>(config: &RetryConfig, retryable: C, mut operation: F) -> Result<T, E>
where
    E: Display,
    C: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    let limit = config.max_attempts.max(1);
    let mut failures = 0;

    loop {
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        failures += 1;
        if failures >= limit || !retryable(&err) {
            return Err(err);
        }

        let pause = config.backoff(failures);
        log::warn!(
            "transient error ({failures}/{limit}): {err}; trying again in {}ms",
            pause.as_millis()
        );
        thread::sleep(pause);
    }
}
