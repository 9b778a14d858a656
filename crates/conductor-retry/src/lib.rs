//! Retry strategies and backoff policies for the conductor kernel.
//!
//! This crate provides the delay math used by the reliability engine:
//! - Per-error-category retry budgets (transient, retriable, rate-limit)
//! - Exponential backoff with additive jitter
//! - A small synchronous executor for wrapping fallible calls
//!
//! # Example
//!
//! ```
//! use conductor_retry::{RetryBudget, transient_delay};
//!
//! let budget = RetryBudget::transient();
//! assert_eq!(budget.max_attempts, 5);
//!
//! // Delay for the second transient attempt, capped at 60s.
//! let delay = transient_delay(2);
//! assert!(delay.as_secs() <= 60);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard cap on any single transient backoff delay.
pub const TRANSIENT_DELAY_CAP: Duration = Duration::from_secs(60);

/// Hard cap honored for server-supplied `Retry-After` hints.
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(300);

/// Backoff shape for a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// No delay between attempts - retry immediately
    Immediate,
    /// Exponential backoff with additive jitter (default)
    #[default]
    Exponential,
    /// Honor a server-supplied delay hint, falling back to exponential
    ServerHinted,
}

/// A bounded retry budget for one error category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Backoff shape between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Maximum number of attempts (first try included).
    pub max_attempts: u32,
    /// Delay cap for backoff calculations.
    #[serde(default = "default_delay_cap")]
    #[serde(with = "humantime_serde")]
    pub delay_cap: Duration,
}

fn default_delay_cap() -> Duration {
    TRANSIENT_DELAY_CAP
}

impl RetryBudget {
    /// Budget for transient failures: exponential backoff, five attempts.
    pub fn transient() -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            max_attempts: 5,
            delay_cap: TRANSIENT_DELAY_CAP,
        }
    }

    /// Budget for retriable failures: immediate, three attempts.
    pub fn retriable() -> Self {
        Self {
            backoff: BackoffKind::Immediate,
            max_attempts: 3,
            delay_cap: Duration::ZERO,
        }
    }

    /// Budget for rate-limited calls: server hint up to 300s, five attempts.
    pub fn rate_limit() -> Self {
        Self {
            backoff: BackoffKind::ServerHinted,
            max_attempts: 5,
            delay_cap: RETRY_AFTER_CAP,
        }
    }

    /// Budget that never retries.
    pub fn none() -> Self {
        Self {
            backoff: BackoffKind::Immediate,
            max_attempts: 1,
            delay_cap: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` tries.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Delay before the next transient retry.
///
/// `delay = min(cap, 2^attempt + uniform(0, 0.5 * 2^attempt))` seconds, with
/// `attempt` counting from 1. The jitter is additive so the deterministic
/// floor of the delay is preserved.
pub fn transient_delay(attempt: u32) -> Duration {
    delay_with_cap(attempt, TRANSIENT_DELAY_CAP)
}

/// Transient-shaped delay with an explicit cap.
pub fn delay_with_cap(attempt: u32, cap: Duration) -> Duration {
    let pow = attempt.min(16);
    let base_secs = 2_u64.saturating_pow(pow);
    let jitter_range = 0.5 * base_secs as f64;
    let jitter: f64 = rand::random::<f64>() * jitter_range;
    let millis = base_secs
        .saturating_mul(1000)
        .saturating_add((jitter * 1000.0).round() as u64);
    Duration::from_millis(millis).min(cap)
}

/// Delay for a server-hinted retry.
///
/// Honors `hint` when present, clamped to the budget's cap; otherwise falls
/// back to the transient shape.
pub fn hinted_delay(budget: &RetryBudget, attempt: u32, hint: Option<Duration>) -> Duration {
    match hint {
        Some(h) => h.min(budget.delay_cap),
        None => delay_with_cap(attempt, budget.delay_cap),
    }
}

/// Delay for the next attempt under `budget`.
pub fn next_delay(budget: &RetryBudget, attempt: u32) -> Duration {
    match budget.backoff {
        BackoffKind::Immediate => Duration::ZERO,
        BackoffKind::Exponential | BackoffKind::ServerHinted => {
            delay_with_cap(attempt, budget.delay_cap)
        }
    }
}

/// A synchronous retry executor driving a fallible operation under a budget.
pub struct RetryExecutor {
    budget: RetryBudget,
}

impl RetryExecutor {
    /// Create an executor with the given budget.
    pub fn new(budget: RetryBudget) -> Self {
        Self { budget }
    }

    /// Execute `operation` until it succeeds or the budget is exhausted.
    ///
    /// The operation receives the current attempt number (starting at 1).
    /// The sleep between attempts follows the budget's backoff shape.
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.budget.allows(attempt) {
                        return Err(e);
                    }

                    let delay = next_delay(&self.budget, attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        // Delays never exceed the cap, whatever the attempt number.
        #[test]
        fn transient_delay_is_always_capped(attempt in 0u32..1000) {
            prop_assert!(transient_delay(attempt) <= TRANSIENT_DELAY_CAP);
        }

        // A server hint is honored but clamped to the budget cap.
        #[test]
        fn hinted_delay_is_clamped(attempt in 0u32..100, hint_ms in 0u64..1_000_000) {
            let budget = RetryBudget::rate_limit();
            let hint = Duration::from_millis(hint_ms);
            let delay = hinted_delay(&budget, attempt, Some(hint));
            prop_assert!(delay <= hint.min(budget.delay_cap).max(Duration::ZERO));
            prop_assert!(delay == hint || delay == budget.delay_cap);
        }
    }
}
