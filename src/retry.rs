//! Bounded, fixed-interval retry.
//!
//! Provisioned endpoints converge eventually (DNS propagation, CDN edge
//! warm-up). A probe is repeated until it succeeds or the attempt ceiling is
//! reached. There is no backoff growth: the interval between attempts is
//! constant, and no sleep follows the final attempt.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Attempt ceiling and constant inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_attempts: u32,
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
}

impl RetryBudget {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Validate the budget (at least one attempt)
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HarnessError::config("retry budget needs at least one attempt"));
        }
        Ok(())
    }
}

/// How the poller waits between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Every attempt failed; carries the last attempt's error verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    pub description: String,
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' unsuccessful after {} attempts: {}",
            self.description, self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryExhausted<E> {}

impl<E: fmt::Display> From<RetryExhausted<E>> for HarnessError {
    fn from(err: RetryExhausted<E>) -> Self {
        HarnessError::RetryExhausted {
            description: err.description,
            attempts: err.attempts,
            last_error: err.last_error.to_string(),
        }
    }
}

/// Repeats a probe within a [`RetryBudget`].
#[derive(Debug, Clone)]
pub struct RetryPoller<S = ThreadSleeper> {
    budget: RetryBudget,
    sleeper: S,
}

impl RetryPoller<ThreadSleeper> {
    /// # Errors
    ///
    /// `Config` if the budget allows no attempts.
    pub fn new(budget: RetryBudget) -> Result<Self> {
        budget.validate()?;
        Ok(Self {
            budget,
            sleeper: ThreadSleeper,
        })
    }
}

impl<S: Sleeper> RetryPoller<S> {
    /// Replace how the poller waits between attempts
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> RetryPoller<S2> {
        RetryPoller {
            budget: self.budget,
            sleeper,
        }
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Invoke `probe` until it succeeds or the budget runs out.
    pub fn run<T, E, F>(&self, description: &str, mut probe: F) -> std::result::Result<T, RetryExhausted<E>>
    where
        E: fmt::Display,
        F: FnMut() -> std::result::Result<T, E>,
    {
        let max_attempts = self.budget.max_attempts;
        let mut attempt = 1;

        loop {
            info!(attempt, max_attempts, "{}", description);

            let err = match probe() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    "'{}' unsuccessful after {} attempts: {}", description, attempt, err
                );
                return Err(RetryExhausted {
                    description: description.to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            }

            warn!(
                attempt,
                "{} returned an error: {}. Sleeping for {:?} and will try again.",
                description,
                err,
                self.budget.interval
            );
            self.sleeper.sleep(self.budget.interval);
            attempt += 1;
        }
    }
}

/// Run `probe` up to `budget.max_attempts` times, sleeping `budget.interval`
/// between failed attempts.
///
/// # Errors
///
/// - `Config` if the budget allows no attempts
/// - `RetryExhausted` carrying the last attempt's error
pub fn do_with_retry<T, E, F>(description: &str, budget: RetryBudget, probe: F) -> Result<T>
where
    E: fmt::Display,
    F: FnMut() -> std::result::Result<T, E>,
{
    Ok(RetryPoller::new(budget)?.run(description, probe)?)
}

/// Serialize a `Duration` as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
