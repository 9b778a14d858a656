//! Monotonic deadlines and run-level cost accounting.
//!
//! Deadlines nest: a flow deadline caps its steps, a step deadline caps its
//! calls, and a child scope can never outlive its parent. Cost is charged
//! exactly once per receipt commit; a charge that would cross the cap is
//! refused so the receipt is never written.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenUsage;

/// Soft and hard limits for one timeout scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPair {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeoutPair {
    pub const fn new(soft: Duration, hard: Duration) -> Self {
        Self { soft, hard }
    }
}

/// Timeout hierarchy. Inner scopes are additionally capped by remaining
/// outer time at deadline-derivation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub flow: TimeoutPair,
    pub step: TimeoutPair,
    pub call: TimeoutPair,
    pub tool: TimeoutPair,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            flow: TimeoutPair::new(Duration::from_secs(30 * 60), Duration::from_secs(45 * 60)),
            step: TimeoutPair::new(Duration::from_secs(10 * 60), Duration::from_secs(15 * 60)),
            call: TimeoutPair::new(Duration::from_secs(2 * 60), Duration::from_secs(3 * 60)),
            tool: TimeoutPair::new(Duration::from_secs(5 * 60), Duration::from_secs(10 * 60)),
        }
    }
}

/// A monotonic deadline, possibly unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    /// No deadline; children still bound themselves.
    pub fn unbounded() -> Self {
        Self { end: None }
    }

    /// Deadline `limit` from now.
    pub fn within(limit: Duration) -> Self {
        Self {
            end: Some(Instant::now() + limit),
        }
    }

    /// Child scope capped at `limit`, never outliving the parent.
    pub fn child(&self, limit: Duration) -> Self {
        let child_end = Instant::now() + limit;
        let end = match self.end {
            Some(parent_end) => parent_end.min(child_end),
            None => child_end,
        };
        Self { end: Some(end) }
    }

    /// Remaining time, `None` when unbounded. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

/// Refused charge: committing would cross the run cap.
#[derive(Debug, Clone, Error)]
#[error(
    "budget exhausted: charging {attempted_usd:.4} USD would take {cumulative_usd:.4} past cap {cap_usd:.4}"
)]
pub struct BudgetExhausted {
    pub attempted_usd: f64,
    pub cumulative_usd: f64,
    pub cap_usd: f64,
}

/// Run-level cost and token counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMeter {
    cap_usd: f64,
    cumulative_usd: f64,
    tokens: TokenUsage,
}

impl CostMeter {
    pub fn new(cap_usd: f64) -> Self {
        Self {
            cap_usd,
            cumulative_usd: 0.0,
            tokens: TokenUsage::default(),
        }
    }

    /// Rebuild a meter from persisted run meta on resume.
    pub fn resumed(cap_usd: f64, already_spent_usd: f64) -> Self {
        Self {
            cap_usd,
            cumulative_usd: already_spent_usd,
            tokens: TokenUsage::default(),
        }
    }

    /// Charge one receipt's cost. Refuses the charge (without mutating)
    /// when it would push the cumulative total past the cap.
    pub fn try_charge(&mut self, cost_usd: f64, tokens: &TokenUsage) -> Result<(), BudgetExhausted> {
        let next = self.cumulative_usd + cost_usd;
        if next > self.cap_usd {
            return Err(BudgetExhausted {
                attempted_usd: cost_usd,
                cumulative_usd: self.cumulative_usd,
                cap_usd: self.cap_usd,
            });
        }
        self.cumulative_usd = next;
        self.tokens.add(tokens);
        Ok(())
    }

    pub fn cumulative_usd(&self) -> f64 {
        self.cumulative_usd
    }

    pub fn cap_usd(&self) -> f64 {
        self.cap_usd
    }

    pub fn tokens(&self) -> &TokenUsage {
        &self.tokens
    }
}
