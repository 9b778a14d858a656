//! Author↔critic micro-loops with bounded iteration.
//!
//! The loop carries a compact state (iteration count, failure signatures,
//! last critic status) between rounds; it never carries prose. Exit
//! conditions, first to fire wins:
//!
//! 1. Critic returns `VERIFIED`.
//! 2. Critic returns `can_further_iteration_help = false`.
//! 3. The iteration counter reaches `max_iter`.
//! 4. The same failure signature is recorded twice, which hands control to
//!    routing for a detour.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::classify::derive_signature;
use crate::types::{Handoff, HandoffStatus, StepResult};

/// Which side of the pair is working this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopRole {
    Author,
    Critic,
}

/// Compact state carried between iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    pub iter: u32,
    pub signatures: Vec<String>,
    pub last_status: Option<HandoffStatus>,
}

impl LoopState {
    /// Record a failure signature; true when it was already present.
    fn record_signature(&mut self, signature: String) -> bool {
        let repeated = self.signatures.contains(&signature);
        self.signatures.push(signature);
        repeated
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Critic verified the work.
    Verified,
    /// Critic sees no viable fix path in further iteration.
    NoViableFix,
    /// Iteration ceiling reached.
    MaxIterations,
    /// Same failure signature twice; routing should detour.
    RepeatedSignature(String),
}

impl LoopExit {
    /// Reason string recorded on the routing decision after the loop.
    pub fn reason(&self) -> String {
        match self {
            LoopExit::Verified => "verified".to_string(),
            LoopExit::NoViableFix => "no_viable_fix_path".to_string(),
            LoopExit::MaxIterations => "max_iterations_reached".to_string(),
            LoopExit::RepeatedSignature(sig) => format!("repeated_signature:{sig}"),
        }
    }
}

/// Outcome of a completed micro-loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub exit: LoopExit,
    /// The critic's final handoff, for routing.
    pub final_handoff: Handoff,
    /// Author cost and token totals accumulated across iterations.
    pub author_results: Vec<StepResult>,
    pub critic_results: Vec<StepResult>,
    pub state: LoopState,
}

/// Drive one micro-loop to an exit.
///
/// `work` executes one role for one iteration and returns its result plus
/// its handoff envelope. Handoffs between author and critic are minimal;
/// the critic's concern (if any) feeds the failure-signature record.
pub fn run_microloop<W>(max_iter: u32, mut work: W) -> Result<LoopOutcome>
where
    W: FnMut(LoopRole, &LoopState) -> Result<(StepResult, Handoff)>,
{
    let mut state = LoopState::default();
    let mut author_results = Vec::new();
    let mut critic_results = Vec::new();

    loop {
        state.iter += 1;

        let (author_result, _author_handoff) = work(LoopRole::Author, &state)?;
        author_results.push(author_result);

        let (critic_result, critic_handoff) = work(LoopRole::Critic, &state)?;
        critic_results.push(critic_result);
        state.last_status = Some(critic_handoff.status);

        if critic_handoff.status == HandoffStatus::Verified {
            return Ok(LoopOutcome {
                iterations: state.iter,
                exit: LoopExit::Verified,
                final_handoff: critic_handoff,
                author_results,
                critic_results,
                state,
            });
        }

        // Blocked is handled by routing; the loop has nothing left to do.
        if critic_handoff.status == HandoffStatus::Blocked {
            return Ok(LoopOutcome {
                iterations: state.iter,
                exit: LoopExit::NoViableFix,
                final_handoff: critic_handoff,
                author_results,
                critic_results,
                state,
            });
        }

        // Track the top concern as this iteration's failure signature.
        if let Some(concern) = critic_handoff.concerns.first() {
            let signature = derive_signature("microloop", &concern.description);
            if state.record_signature(signature.clone()) {
                return Ok(LoopOutcome {
                    iterations: state.iter,
                    exit: LoopExit::RepeatedSignature(signature),
                    final_handoff: critic_handoff,
                    author_results,
                    critic_results,
                    state,
                });
            }
        }

        if !critic_handoff.routing.can_further_iteration_help {
            return Ok(LoopOutcome {
                iterations: state.iter,
                exit: LoopExit::NoViableFix,
                final_handoff: critic_handoff,
                author_results,
                critic_results,
                state,
            });
        }

        if state.iter >= max_iter {
            return Ok(LoopOutcome {
                iterations: state.iter,
                exit: LoopExit::MaxIterations,
                final_handoff: critic_handoff,
                author_results,
                critic_results,
                state,
            });
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::{HandoffMeta, RoutingHint};

    // Termination: every loop exits in at most max_iter + 1 iterations no
    // matter what the critic reports.
    proptest! {
        #[test]
        fn loop_always_terminates(
            max_iter in 1u32..6,
            verdicts in prop::collection::vec((0u8..3, any::<bool>()), 1..12),
        ) {
            let mut round = 0usize;
            let outcome = run_microloop(max_iter, |role, _state| {
                let meta = HandoffMeta {
                    step_id: "s".to_string(),
                    agent_key: "a".to_string(),
                    flow_key: "f".to_string(),
                };
                Ok(match role {
                    LoopRole::Author => (
                        StepResult::succeeded(),
                        Handoff::minimal(meta, HandoffStatus::Unverified, "work"),
                    ),
                    LoopRole::Critic => {
                        let (status_pick, can_help) =
                            verdicts[round.min(verdicts.len() - 1)];
                        round += 1;
                        let status = match status_pick {
                            0 => HandoffStatus::Verified,
                            1 => HandoffStatus::Unverified,
                            _ => HandoffStatus::Blocked,
                        };
                        let mut h = Handoff::minimal(meta, status, "review");
                        h.routing = RoutingHint {
                            recommendation: String::new(),
                            can_further_iteration_help: can_help,
                            reason: String::new(),
                        };
                        (StepResult::succeeded(), h)
                    }
                })
            })
            .unwrap();

            prop_assert!(outcome.iterations <= max_iter + 1);
        }
    }
}
