//! The reliability engine wrapping backend and skill calls.
//!
//! Retry behavior is category-driven: transient failures back off
//! exponentially with jitter (five attempts, 60s delay cap), rate limits
//! honor `Retry-After` up to 300s, retriable failures get three immediate
//! attempts, and permanent or fatal failures never retry. A per-target
//! circuit breaker fast-fails calls while a target is known bad.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use conductor_retry::{RetryBudget, hinted_delay, transient_delay};

use crate::budget::Deadline;
use crate::cancel::CancelToken;
use crate::classify::{Classified, ErrorCategory, RawFailure, classify};

/// Consecutive failures that trip a breaker open.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Cooldown before an open breaker allows a probe.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Total consecutive failures that escalate instead of retrying.
pub const BREAKER_ESCALATE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker for one target. Rebuilt conservatively (closed) after a
/// process restart; disk evidence is not consulted.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    total_consecutive: u32,
    opened_at: Option<Instant>,
}

/// What the caller should do before invoking the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Target believed healthy (or half-open probe allowed).
    Proceed,
    /// Open and cooling down; fail without invoking the target.
    FastFail,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            total_consecutive: 0,
            opened_at: None,
        }
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn check(&mut self) -> BreakerCheck {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => BreakerCheck::Proceed,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .map(|at| at.elapsed() >= BREAKER_COOLDOWN)
                    .unwrap_or(true);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    BreakerCheck::Proceed
                } else {
                    BreakerCheck::FastFail
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.total_consecutive = 0;
        self.opened_at = None;
    }

    /// Record a failure. Returns true when the target has failed enough
    /// consecutive times that the caller must escalate.
    pub fn on_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.total_consecutive += 1;

        if self.total_consecutive >= BREAKER_ESCALATE_THRESHOLD {
            return true;
        }

        if self.consecutive_failures >= BREAKER_FAILURE_THRESHOLD
            || self.state == BreakerState::HalfOpen
        {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            self.consecutive_failures = 0;
        }
        false
    }
}

/// Per-process breaker registry keyed by target.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(&self, target: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        f(breakers.entry(target.to_string()).or_default())
    }

    pub fn state(&self, target: &str) -> BreakerState {
        self.with(target, |b| b.state())
    }
}

/// Outcome of one reliability-wrapped call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The call succeeded after `attempts` tries.
    Success { value: T, attempts: u32 },
    /// Retries exhausted or a non-retryable failure.
    Failed(Classified),
    /// The breaker for `target` was open; the target was not invoked.
    FastFailed { target: String },
    /// Five consecutive failures on `target`; escalate.
    BreakerEscalate { target: String, last: Classified },
    /// The enclosing deadline fired.
    TimedOut,
    /// Cooperative cancellation observed.
    Cancelled,
}

/// One retry notification, for step logs.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub category: ErrorCategory,
    pub retry_count: u32,
    pub delay: Duration,
}

/// Execute `op` under the reliability contract for `target`.
///
/// `on_retry` fires before each sleep so the caller can log the attempt.
pub fn execute_with_retries<T>(
    breakers: &BreakerRegistry,
    target: &str,
    deadline: &Deadline,
    cancel: &CancelToken,
    mut op: impl FnMut(u32) -> Result<T, RawFailure>,
    mut on_retry: impl FnMut(&RetryNotice),
) -> CallOutcome<T> {
    let transient_budget = RetryBudget::transient();
    let retriable_budget = RetryBudget::retriable();
    let rate_limit_budget = RetryBudget::rate_limit();

    let mut attempts = 0u32;
    let mut transient_attempts = 0u32;
    let mut retriable_attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return CallOutcome::Cancelled;
        }
        if deadline.expired() {
            return CallOutcome::TimedOut;
        }

        match breakers.with(target, |b| b.check()) {
            BreakerCheck::Proceed => {}
            BreakerCheck::FastFail => {
                return CallOutcome::FastFailed {
                    target: target.to_string(),
                };
            }
        }

        attempts += 1;
        match op(attempts) {
            Ok(value) => {
                breakers.with(target, |b| b.on_success());
                return CallOutcome::Success { value, attempts };
            }
            Err(raw) => {
                let classified = classify(&raw);

                // The breaker counts whole-call failures, not individual
                // retry attempts; a call that recovers on retry records a
                // success.
                let fail_call = |classified: Classified| {
                    let escalate = breakers.with(target, |b| b.on_failure());
                    if escalate {
                        CallOutcome::BreakerEscalate {
                            target: target.to_string(),
                            last: classified,
                        }
                    } else {
                        CallOutcome::Failed(classified)
                    }
                };

                match classified.category {
                    ErrorCategory::Fatal | ErrorCategory::Permanent => {
                        return fail_call(classified);
                    }
                    ErrorCategory::Transient => {
                        transient_attempts += 1;
                        if !transient_budget.allows(transient_attempts) {
                            return fail_call(classified);
                        }

                        let delay = match classified.retry_after() {
                            Some(hint) => {
                                hinted_delay(&rate_limit_budget, transient_attempts, Some(hint))
                            }
                            None => transient_delay(transient_attempts),
                        };
                        let delay = clamp_to_deadline(delay, deadline);
                        on_retry(&RetryNotice {
                            category: ErrorCategory::Transient,
                            retry_count: transient_attempts,
                            delay,
                        });
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                    ErrorCategory::Retriable => {
                        retriable_attempts += 1;
                        if !retriable_budget.allows(retriable_attempts) {
                            return fail_call(classified);
                        }
                        on_retry(&RetryNotice {
                            category: ErrorCategory::Retriable,
                            retry_count: retriable_attempts,
                            delay: Duration::ZERO,
                        });
                    }
                }
            }
        }
    }
}

fn clamp_to_deadline(delay: Duration, deadline: &Deadline) -> Duration {
    match deadline.remaining() {
        Some(remaining) => delay.min(remaining),
        None => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(times: u32, raw: RawFailure) -> impl FnMut(u32) -> Result<u32, RawFailure> {
        let mut calls = 0;
        move |attempt| {
            calls += 1;
            if calls <= times {
                Err(raw.clone())
            } else {
                Ok(attempt)
            }
        }
    }

    #[test]
    fn success_on_first_attempt_closes_breaker() {
        let breakers = BreakerRegistry::new();
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &CancelToken::new(),
            |_| Ok::<_, RawFailure>(42),
            |_| {},
        );
        assert!(matches!(
            outcome,
            CallOutcome::Success { value: 42, attempts: 1 }
        ));
        assert_eq!(breakers.state("backend:stub"), BreakerState::Closed);
    }

    #[test]
    fn retriable_failures_retry_immediately_up_to_three() {
        let breakers = BreakerRegistry::new();
        let mut notices = Vec::new();
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &CancelToken::new(),
            failing(2, RawFailure::message("some unexplained flake")),
            |n| notices.push(n.clone()),
        );
        assert!(matches!(outcome, CallOutcome::Success { attempts: 3, .. }));
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| n.delay.is_zero()));
        assert!(notices.iter().all(|n| n.category == ErrorCategory::Retriable));
    }

    #[test]
    fn retriable_budget_exhausts_after_three_attempts() {
        let breakers = BreakerRegistry::new();
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &CancelToken::new(),
            failing(10, RawFailure::message("some unexplained flake")),
            |_| {},
        );
        match outcome {
            CallOutcome::Failed(classified) => {
                assert_eq!(classified.category, ErrorCategory::Retriable);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_honors_retry_after_hint() {
        let breakers = BreakerRegistry::new();
        let mut notices = Vec::new();
        let raw = RawFailure {
            message: "too many requests".to_string(),
            http_status: Some(429),
            retry_after: Some(Duration::from_millis(50)),
            ..RawFailure::default()
        };
        let outcome = execute_with_retries(
            &breakers,
            "backend:sdk",
            &Deadline::unbounded(),
            &CancelToken::new(),
            failing(1, raw),
            |n| notices.push(n.clone()),
        );
        assert!(matches!(outcome, CallOutcome::Success { attempts: 2, .. }));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].retry_count, 1);
        assert_eq!(notices[0].delay, Duration::from_millis(50));
    }

    #[test]
    fn permanent_failures_never_retry() {
        let breakers = BreakerRegistry::new();
        let mut retry_count = 0;
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &CancelToken::new(),
            failing(5, RawFailure::http(403, "forbidden")),
            |_| retry_count += 1,
        );
        assert!(matches!(outcome, CallOutcome::Failed(c) if c.category == ErrorCategory::Permanent));
        assert_eq!(retry_count, 0);
    }

    #[test]
    fn fatal_failures_never_retry() {
        let breakers = BreakerRegistry::new();
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &CancelToken::new(),
            failing(5, RawFailure::message("secret detected in output")),
            |_| {},
        );
        assert!(matches!(outcome, CallOutcome::Failed(c) if c.category == ErrorCategory::Fatal));
    }

    #[test]
    fn expired_deadline_times_out_before_calling() {
        let breakers = BreakerRegistry::new();
        let deadline = Deadline::within(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        let mut called = false;
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &deadline,
            &CancelToken::new(),
            |_| {
                called = true;
                Ok::<_, RawFailure>(())
            },
            |_| {},
        );
        assert!(matches!(outcome, CallOutcome::TimedOut));
        assert!(!called);
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let breakers = BreakerRegistry::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = execute_with_retries(
            &breakers,
            "backend:stub",
            &Deadline::unbounded(),
            &cancel,
            |_| Ok::<_, RawFailure>(()),
            |_| {},
        );
        assert!(matches!(outcome, CallOutcome::Cancelled));
    }

    #[test]
    fn breaker_opens_after_three_consecutive_failures() {
        let mut breaker = CircuitBreaker::new();
        assert_eq!(breaker.check(), BreakerCheck::Proceed);
        assert!(!breaker.on_failure());
        assert!(!breaker.on_failure());
        assert!(!breaker.on_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.check(), BreakerCheck::FastFail);
    }

    #[test]
    fn breaker_success_resets_to_closed() {
        let mut breaker = CircuitBreaker::new();
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Counter reset: three more failures are needed to open.
        assert!(!breaker.on_failure());
        assert!(!breaker.on_failure());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_escalates_at_five_total_consecutive() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.on_failure());
        assert!(!breaker.on_failure());
        assert!(!breaker.on_failure()); // opens
        assert!(!breaker.on_failure());
        assert!(breaker.on_failure()); // fifth: escalate
    }

    #[test]
    fn open_breaker_fast_fails_without_invoking_target() {
        let breakers = BreakerRegistry::new();
        breakers.with("backend:flaky", |b| {
            b.on_failure();
            b.on_failure();
            b.on_failure();
        });

        let mut called = false;
        let outcome = execute_with_retries(
            &breakers,
            "backend:flaky",
            &Deadline::unbounded(),
            &CancelToken::new(),
            |_| {
                called = true;
                Ok::<_, RawFailure>(())
            },
            |_| {},
        );
        assert!(matches!(outcome, CallOutcome::FastFailed { .. }));
        assert!(!called);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let mut breaker = CircuitBreaker {
            state: BreakerState::HalfOpen,
            consecutive_failures: 0,
            total_consecutive: 3,
            opened_at: None,
        };
        assert_eq!(breaker.check(), BreakerCheck::Proceed);
        assert!(!breaker.on_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
