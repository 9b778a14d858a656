//! The flow scheduler: walks a flow graph step by step, enforcing
//! at-most-once commits and checkpoint-then-advance ordering.
//!
//! Per-step lifecycle: WORK (agent or skill, micro-loops and detours
//! included) → FINALIZE (receipt + handoff) → ROUTE → ADVANCE. The receipt
//! is committed first; the routing decision and its scent entry land
//! strictly after it. Routing calls made during the lifecycle (loop
//! continuations, detours) are buffered and persisted in order once the
//! receipt exists.
//!
//! Independent steps run in parallel only when their declared `writes`
//! sets are disjoint. Workers share the ledger through path-unique files;
//! the commit sequence itself is serialized.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::backend::{Backend, Capability};
use crate::budget::{CostMeter, Deadline, TimeoutPolicy};
use crate::cancel::{CancelToken, RunControl};
use crate::classify::{Classified, ErrorCategory, SignatureTracker, derive_signature};
use crate::context::{ContextItem, PackOutcome, Priority, RoleBudget};
use crate::gate::GatePolicy;
use crate::ledger::Ledger;
use crate::microloop::{LoopExit, LoopRole, run_microloop};
use crate::plan;
use crate::reliability::{BreakerRegistry, CallOutcome, execute_with_retries};
use crate::report::Reporter;
use crate::routing::{
    DetourCatalog, ForensicPack, Navigator, Routed, RoutingInput, decide, inputs_hash,
};
use crate::skill::{SkillEntry, run_skill};
use crate::types::{
    CURRENT_HANDOFF_VERSION, CURRENT_RECEIPT_VERSION, Concern, Decision, DecisionSource,
    Degradation, EngineMode, FlowSpec, Handoff, HandoffMeta, HandoffStatus, HandoffSummary,
    KernelEvent, KernelEventKind, Receipt, RoutingHint, RunMeta, ScentEntry, StepLogEntry,
    StepSpec, StepStatus, TokenUsage,
};

/// The explicit kernel value carried through every subsystem. No module
/// state, no singletons; tests build one with an in-memory-ish ledger and a
/// stub backend.
pub struct Kernel {
    pub ledger: Ledger,
    pub backend: Arc<dyn Backend>,
    pub navigator: Arc<dyn Navigator>,
    pub skills: crate::skill::SkillRegistry,
    pub detours: DetourCatalog,
    pub breakers: BreakerRegistry,
    pub timeouts: TimeoutPolicy,
    pub gate_policy: GatePolicy,
    pub mode: EngineMode,
    /// Commit the workspace evidence is bound to.
    pub commit_sha: String,
}

/// How a flow ended, as reported to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Completed,
    Escalated { step_id: String, reason: String },
    Terminated { step_id: String, reason: String },
    InjectFlow { flow_key: String },
    BudgetExhausted,
    Paused,
    Cancelled,
    TimedOut,
}

/// Per-step verdict inside a flow walk.
#[derive(Debug, Clone, PartialEq)]
enum StepDisposition {
    Advanced,
    Escalate { reason: String },
    Terminate { reason: String },
    Inject { flow_key: String },
    Budget,
    Cancelled,
}

/// Shared commit state for parallel workers. The lock also serializes the
/// receipt → handoff → routing → scent sequence.
struct CommitState {
    meter: CostMeter,
    meta: RunMeta,
}

/// Reporter that buffers lines inside a worker; flushed after join.
#[derive(Debug, Default)]
struct BufferedReporter {
    lines: Vec<(u8, String)>,
}

impl Reporter for BufferedReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push((0, msg.to_string()));
    }
    fn warn(&mut self, msg: &str) {
        self.lines.push((1, msg.to_string()));
    }
    fn error(&mut self, msg: &str) {
        self.lines.push((2, msg.to_string()));
    }
}

impl BufferedReporter {
    fn flush(self, reporter: &mut dyn Reporter) {
        for (level, line) in self.lines {
            match level {
                0 => reporter.info(&line),
                1 => reporter.warn(&line),
                _ => reporter.error(&line),
            }
        }
    }
}

/// Walk one flow to an outcome. `meter` and `meta` are updated in place and
/// persisted after every receipt commit.
pub fn run_flow(
    kernel: &Kernel,
    meta: &mut RunMeta,
    meter: &mut CostMeter,
    flow: &FlowSpec,
    control: &RunControl,
    reporter: &mut dyn Reporter,
) -> Result<FlowOutcome> {
    plan::validate_flow(flow)?;
    let run_id = meta.run_id.clone();
    let flow_deadline = Deadline::within(kernel.timeouts.flow.hard);

    // Resume scan: a step is complete only when its receipt, handoff, and
    // routing decision all exist. Receipt + handoff without a routing
    // decision re-routes from the stored entities; a receipt without its
    // handoff marks an incomplete step, retried from scratch with the stale
    // receipt preserved in quarantine.
    let routed_steps: BTreeSet<String> = kernel
        .ledger
        .routing_decisions(&run_id, &flow.flow_key)?
        .into_iter()
        .map(|r| r.from_step)
        .collect();
    let mut completed: BTreeSet<String> = BTreeSet::new();
    for step in &flow.steps {
        let has_receipt = kernel
            .ledger
            .has_receipt(&run_id, &flow.flow_key, &step.step_id, &step.agent_key);
        let has_handoff = kernel
            .ledger
            .has_handoff(&run_id, &flow.flow_key, &step.step_id, &step.agent_key);
        if has_receipt && has_handoff && routed_steps.contains(&step.step_id) {
            reporter.info(&format!(
                "{}/{}: already committed (skipping)",
                flow.flow_key, step.step_id
            ));
            completed.insert(step.step_id.clone());
        } else if has_receipt && !has_handoff {
            reporter.warn(&format!(
                "{}/{}: receipt without handoff; retrying from scratch",
                flow.flow_key, step.step_id
            ));
            kernel.ledger.retire_incomplete_receipt(
                &run_id,
                &flow.flow_key,
                &step.step_id,
                &step.agent_key,
            )?;
        }
    }

    let commit = Mutex::new(CommitState {
        meter: meter.clone(),
        meta: meta.clone(),
    });

    let sync_back = |commit: &Mutex<CommitState>, meter: &mut CostMeter, meta: &mut RunMeta| {
        let state = commit.lock().unwrap_or_else(|e| e.into_inner());
        *meter = state.meter.clone();
        *meta = state.meta.clone();
    };

    loop {
        if completed.len() == flow.steps.len() {
            sync_back(&commit, meter, meta);
            return Ok(FlowOutcome::Completed);
        }
        if control.is_cancelled() {
            sync_back(&commit, meter, meta);
            return Ok(FlowOutcome::Cancelled);
        }
        if control.is_paused() {
            sync_back(&commit, meter, meta);
            return Ok(FlowOutcome::Paused);
        }
        if flow_deadline.expired() {
            sync_back(&commit, meter, meta);
            return Ok(FlowOutcome::TimedOut);
        }

        let ready = plan::ready_steps(flow, &completed);
        if ready.is_empty() {
            sync_back(&commit, meter, meta);
            anyhow::bail!(
                "flow {} stalled with {} of {} steps committed",
                flow.flow_key,
                completed.len(),
                flow.steps.len()
            );
        }
        let group = plan::parallel_group(&ready);

        let results: Vec<(String, Result<StepDisposition>)> = if group.len() == 1 {
            let step = group[0];
            vec![(
                step.step_id.clone(),
                run_step(kernel, &run_id, &commit, flow, step, &flow_deadline, control, reporter),
            )]
        } else {
            run_group_parallel(kernel, &run_id, &commit, flow, &group, &flow_deadline, control, reporter)
        };

        for (step_id, result) in results {
            let disposition = result?;
            match disposition {
                StepDisposition::Advanced => {
                    completed.insert(step_id);
                }
                StepDisposition::Escalate { reason } => {
                    sync_back(&commit, meter, meta);
                    return Ok(FlowOutcome::Escalated { step_id, reason });
                }
                StepDisposition::Terminate { reason } => {
                    sync_back(&commit, meter, meta);
                    return Ok(FlowOutcome::Terminated { step_id, reason });
                }
                StepDisposition::Inject { flow_key } => {
                    sync_back(&commit, meter, meta);
                    return Ok(FlowOutcome::InjectFlow { flow_key });
                }
                StepDisposition::Budget => {
                    sync_back(&commit, meter, meta);
                    return Ok(FlowOutcome::BudgetExhausted);
                }
                StepDisposition::Cancelled => {
                    sync_back(&commit, meter, meta);
                    return Ok(FlowOutcome::Cancelled);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_group_parallel(
    kernel: &Kernel,
    run_id: &str,
    commit: &Mutex<CommitState>,
    flow: &FlowSpec,
    group: &[&StepSpec],
    flow_deadline: &Deadline,
    control: &RunControl,
    reporter: &mut dyn Reporter,
) -> Vec<(String, Result<StepDisposition>)> {
    let mut results = Vec::with_capacity(group.len());
    let joined: Vec<(String, Result<StepDisposition>, BufferedReporter)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = group
                .iter()
                .map(|step| {
                    scope.spawn(move || {
                        let mut buffered = BufferedReporter::default();
                        let result = run_step(
                            kernel,
                            run_id,
                            commit,
                            flow,
                            step,
                            flow_deadline,
                            control,
                            &mut buffered,
                        );
                        (step.step_id.clone(), result, buffered)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        (
                            String::new(),
                            Err(anyhow!("step worker panicked")),
                            BufferedReporter::default(),
                        )
                    })
                })
                .collect()
        });

    for (step_id, result, buffered) in joined {
        buffered.flush(reporter);
        results.push((step_id, result));
    }
    results
}

// ---- step lifecycle -------------------------------------------------------

struct WorkOutput {
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: u64,
    status: StepStatus,
    tokens: TokenUsage,
    cost_usd: f64,
    exit_code: Option<i32>,
    evidence: Vec<PathBuf>,
    overflow: Vec<String>,
    timeout_event: Option<String>,
    handoff: Handoff,
    failure: Option<Classified>,
    last_signature: Option<String>,
    loop_iterations: u32,
    loop_exit: Option<LoopExit>,
}

enum WorkResult {
    Done(Box<WorkOutput>),
    FastFailed { target: String },
    BreakerEscalate { target: String, last: Classified },
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
fn run_step(
    kernel: &Kernel,
    run_id: &str,
    commit: &Mutex<CommitState>,
    flow: &FlowSpec,
    step: &StepSpec,
    flow_deadline: &Deadline,
    control: &RunControl,
    reporter: &mut dyn Reporter,
) -> Result<StepDisposition> {
    let step_limit = step
        .timeout_override_ms
        .map(Duration::from_millis)
        .unwrap_or(kernel.timeouts.step.hard);
    let step_deadline = flow_deadline.child(step_limit);

    // Route-only recovery: a crash after handoff commit but before the
    // routing decision leaves both entities on disk; re-route from them.
    if kernel
        .ledger
        .has_receipt(run_id, &flow.flow_key, &step.step_id, &step.agent_key)
        && kernel
            .ledger
            .has_handoff(run_id, &flow.flow_key, &step.step_id, &step.agent_key)
    {
        return reroute_committed_step(kernel, run_id, flow, step);
    }

    let mut tracker = SignatureTracker::new();
    let mut detour_attempts: u32 = 0;
    let mut lifecycle_cost = 0.0_f64;
    let mut lifecycle_tokens = TokenUsage::default();
    let mut buffered: Vec<(crate::types::RoutingRecord, ScentEntry)> = Vec::new();

    loop {
        if control.is_cancelled() {
            return Ok(StepDisposition::Cancelled);
        }

        kernel.ledger.append_event(
            run_id,
            &KernelEvent::now(KernelEventKind::StepStart {
                flow: flow.flow_key.clone(),
                step: step.step_id.clone(),
            }),
        )?;
        reporter.info(&format!("{}/{}: working...", flow.flow_key, step.step_id));

        let work = execute_step_work(
            kernel,
            run_id,
            flow,
            step,
            &step_deadline,
            control.cancel_token(),
            &mut tracker,
        )?;

        let out = match work {
            WorkResult::Cancelled => return Ok(StepDisposition::Cancelled),
            WorkResult::FastFailed { target } => {
                kernel
                    .ledger
                    .append_step_log(
                        run_id,
                        &flow.flow_key,
                        &step.step_id,
                        &StepLogEntry::BreakerFastFail {
                            target: target.clone(),
                            at: Utc::now(),
                        },
                    )
                    .ok();
                kernel.ledger.append_degradation(
                    run_id,
                    &flow.flow_key,
                    &Degradation {
                        at: Utc::now(),
                        step: step.step_id.clone(),
                        category: "circuit_open".to_string(),
                        message: format!("circuit open for {target}; call fast-failed"),
                        remediation: "wait for cooldown or resolve the target outage".to_string(),
                    },
                )?;
                return Ok(StepDisposition::Escalate {
                    reason: format!("circuit_open:{target}"),
                });
            }
            WorkResult::BreakerEscalate { target, last } => {
                kernel.ledger.append_degradation(
                    run_id,
                    &flow.flow_key,
                    &Degradation {
                        at: Utc::now(),
                        step: step.step_id.clone(),
                        category: "breaker_escalate".to_string(),
                        message: format!("{target} failed repeatedly: {}", last.message),
                        remediation: "human attention required".to_string(),
                    },
                )?;
                return Ok(StepDisposition::Escalate {
                    reason: format!("breaker_escalate:{target}"),
                });
            }
            WorkResult::Done(out) => out,
        };

        lifecycle_cost += out.cost_usd;
        lifecycle_tokens.add(&out.tokens);

        if let Some(scope) = &out.timeout_event {
            kernel.ledger.append_event(
                run_id,
                &KernelEvent::now(KernelEventKind::TimeoutEvent {
                    flow: flow.flow_key.clone(),
                    step: step.step_id.clone(),
                    scope: scope.clone(),
                }),
            )?;
        }

        // Buffer one LOOP record per continued micro-loop iteration; they
        // persist after the receipt, in order.
        for iter in 1..out.loop_iterations {
            let routedd = loop_continuation(step, iter, out.loop_iterations);
            buffered.push((routedd.record(&step.step_id), routedd.scent(&step.step_id)));
        }

        let routed = route_step_outcome(kernel, flow, step, &out, &tracker, detour_attempts);

        if routed.decision == Decision::Detour {
            let Some(target) = routed.target.clone() else {
                return Ok(StepDisposition::Escalate {
                    reason: "detour_without_target".to_string(),
                });
            };
            buffered.push((routed.record(&step.step_id), routed.scent(&step.step_id)));
            detour_attempts += 1;

            match kernel.skills.get(&target) {
                Some(entry) => {
                    run_detour(kernel, run_id, flow, step, &target, entry, &step_deadline, reporter)?;
                    continue;
                }
                None => {
                    return Ok(StepDisposition::Escalate {
                        reason: format!("unknown identifier: detour skill {target}"),
                    });
                }
            }
        }

        // Checkpoint-then-advance, under the commit lock: budget charge,
        // receipt, meta, handoff, routing, scent — in that order.
        {
            let mut state = commit.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(exhausted) = state.meter.try_charge(lifecycle_cost, &lifecycle_tokens) {
                drop(state);
                reporter.error(&format!(
                    "{}/{}: {exhausted}; receipt not committed",
                    flow.flow_key, step.step_id
                ));
                kernel.ledger.forensics_snapshot(
                    run_id,
                    &flow.flow_key,
                    "budget-exhausted",
                    &serde_json::json!({
                        "step": step.step_id,
                        "attempted_usd": exhausted.attempted_usd,
                        "cumulative_usd": exhausted.cumulative_usd,
                        "cap_usd": exhausted.cap_usd,
                    }),
                )?;
                return Ok(StepDisposition::Budget);
            }

            let receipt = Receipt {
                schema_version: CURRENT_RECEIPT_VERSION.to_string(),
                run_id: run_id.to_string(),
                flow_key: flow.flow_key.clone(),
                step_id: step.step_id.clone(),
                agent_key: step.agent_key.clone(),
                engine: kernel.backend.descriptor().engine,
                mode: kernel.mode,
                started_at: out.started_at,
                completed_at: out.completed_at,
                duration_ms: out.duration_ms,
                status: out.status,
                tokens: lifecycle_tokens,
                cost_usd: lifecycle_cost,
                exit_code: out.exit_code,
                commit_sha: kernel.commit_sha.clone(),
                evidence: out.evidence.clone(),
                ac_ids: step.ac_ids.clone(),
                budget_overflow: out.overflow.clone(),
                timeout_event: out.timeout_event.clone(),
            };
            kernel
                .ledger
                .write_receipt(&receipt)
                .map_err(|e| anyhow!("receipt commit failed: {e}"))?;

            state.meta.cumulative_cost = state.meter.cumulative_usd();
            kernel
                .ledger
                .write_meta(&state.meta)
                .map_err(|e| anyhow!("meta write failed: {e}"))?;

            kernel
                .ledger
                .write_handoff(run_id, &out.handoff)
                .map_err(|e| anyhow!("handoff commit failed: {e}"))?;

            kernel.ledger.append_event(
                run_id,
                &KernelEvent::now(KernelEventKind::StepFinalized {
                    flow: flow.flow_key.clone(),
                    step: step.step_id.clone(),
                    status: out.status,
                }),
            )?;

            for (record, scent) in buffered.drain(..) {
                kernel.ledger.append_routing(run_id, &flow.flow_key, &record)?;
                kernel.ledger.append_scent(run_id, &flow.flow_key, &scent)?;
            }
            kernel
                .ledger
                .append_routing(run_id, &flow.flow_key, &routed.record(&step.step_id))?;
            kernel.ledger.append_event(
                run_id,
                &KernelEvent::now(KernelEventKind::RouteDecision {
                    flow: flow.flow_key.clone(),
                    step: step.step_id.clone(),
                    decision: routed.decision,
                }),
            )?;
            kernel
                .ledger
                .append_scent(run_id, &flow.flow_key, &routed.scent(&step.step_id))?;
        }

        reporter.info(&format!(
            "{}/{}: {:?} -> {:?} ({})",
            flow.flow_key, step.step_id, out.status, routed.decision, routed.reason
        ));

        return Ok(match routed.decision {
            Decision::Continue => StepDisposition::Advanced,
            Decision::InjectFlow => StepDisposition::Inject {
                flow_key: routed.target.unwrap_or_else(|| "reset".to_string()),
            },
            Decision::Escalate => StepDisposition::Escalate {
                reason: routed.reason,
            },
            Decision::Terminate => StepDisposition::Terminate {
                reason: routed.reason,
            },
            // Loop is consumed inside the micro-loop controller; Detour was
            // handled above. Reaching either here is a routing bug.
            Decision::Loop | Decision::Detour => StepDisposition::Escalate {
                reason: format!("unexpected_decision:{:?}", routed.decision),
            },
        });
    }
}

/// Re-route a step whose receipt and handoff are already committed but
/// whose routing decision is missing (crash window recovery).
fn reroute_committed_step(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
) -> Result<StepDisposition> {
    let already_routed = kernel
        .ledger
        .routing_decisions(run_id, &flow.flow_key)?
        .iter()
        .any(|r| r.from_step == step.step_id);
    if already_routed {
        return Ok(StepDisposition::Advanced);
    }

    let receipt = kernel
        .ledger
        .read_receipt(run_id, &flow.flow_key, &step.step_id, &step.agent_key)?
        .context("receipt disappeared during reroute")?;
    let handoff = kernel
        .ledger
        .read_handoff(run_id, &flow.flow_key, &step.step_id, &step.agent_key)?
        .context("handoff disappeared during reroute")?;

    let tracker = SignatureTracker::new();
    let input = RoutingInput {
        flow_key: &flow.flow_key,
        step_id: &step.step_id,
        handoff: Some(&handoff),
        receipt_status: receipt.status,
        in_microloop: false,
        iteration: 0,
        max_iter: 0,
        signatures: &tracker,
        last_signature: None,
        detour_attempts: 0,
        rebase_needed: false,
        forensics: forensic_pack(step, Some(receipt.status), Some(handoff.status), 0, &tracker),
    };
    let routed = decide(&input, &kernel.detours, kernel.navigator.as_ref());

    kernel
        .ledger
        .append_routing(run_id, &flow.flow_key, &routed.record(&step.step_id))?;
    kernel.ledger.append_event(
        run_id,
        &KernelEvent::now(KernelEventKind::RouteDecision {
            flow: flow.flow_key.clone(),
            step: step.step_id.clone(),
            decision: routed.decision,
        }),
    )?;
    kernel
        .ledger
        .append_scent(run_id, &flow.flow_key, &routed.scent(&step.step_id))?;

    Ok(match routed.decision {
        Decision::Continue => StepDisposition::Advanced,
        Decision::Escalate => StepDisposition::Escalate {
            reason: routed.reason,
        },
        Decision::Terminate => StepDisposition::Terminate {
            reason: routed.reason,
        },
        Decision::InjectFlow => StepDisposition::Inject {
            flow_key: routed.target.unwrap_or_else(|| "reset".to_string()),
        },
        Decision::Loop | Decision::Detour => StepDisposition::Advanced,
    })
}

fn loop_continuation(step: &StepSpec, iter: u32, total: u32) -> Routed {
    let pack = ForensicPack {
        step_id: step.step_id.clone(),
        agent_key: step.agent_key.clone(),
        iteration: iter,
        ..ForensicPack::default()
    };
    Routed {
        decision: Decision::Loop,
        source: DecisionSource::FastPath,
        reason: format!("iteration_can_help ({iter} of {total})"),
        target: None,
        inputs_hash: inputs_hash(&pack),
        confidence: 1.0,
    }
}

fn forensic_pack(
    step: &StepSpec,
    receipt_status: Option<StepStatus>,
    handoff_status: Option<HandoffStatus>,
    iteration: u32,
    tracker: &SignatureTracker,
) -> ForensicPack {
    ForensicPack {
        step_id: step.step_id.clone(),
        agent_key: step.agent_key.clone(),
        receipt_status,
        handoff_status,
        iteration,
        signatures: tracker.repeated(1),
        ..ForensicPack::default()
    }
}

/// Route the outcome of one completed work phase.
fn route_step_outcome(
    kernel: &Kernel,
    flow: &FlowSpec,
    step: &StepSpec,
    out: &WorkOutput,
    tracker: &SignatureTracker,
    detour_attempts: u32,
) -> Routed {
    let forensics = forensic_pack(
        step,
        Some(out.status),
        Some(out.handoff.status),
        out.loop_iterations,
        tracker,
    );

    // Fatal failures halt the run; that is policy, not advice.
    if let Some(failure) = &out.failure {
        if failure.category == ErrorCategory::Fatal {
            return Routed {
                decision: Decision::Terminate,
                source: DecisionSource::Policy,
                reason: format!("fatal:{}", failure.message),
                target: None,
                inputs_hash: inputs_hash(&forensics),
                confidence: 1.0,
            };
        }
    }

    // Loop exits that end the step with a fix-forward continue.
    match &out.loop_exit {
        Some(LoopExit::NoViableFix) if out.handoff.status != HandoffStatus::Blocked => {
            return Routed {
                decision: Decision::Continue,
                source: DecisionSource::Policy,
                reason: "no_viable_fix_path".to_string(),
                target: None,
                inputs_hash: inputs_hash(&forensics),
                confidence: 1.0,
            };
        }
        Some(LoopExit::MaxIterations) => {
            return Routed {
                decision: Decision::Continue,
                source: DecisionSource::Policy,
                reason: "max_iterations_reached".to_string(),
                target: None,
                inputs_hash: inputs_hash(&forensics),
                confidence: 1.0,
            };
        }
        _ => {}
    }

    let input = RoutingInput {
        flow_key: &flow.flow_key,
        step_id: &step.step_id,
        handoff: Some(&out.handoff),
        receipt_status: out.status,
        in_microloop: false,
        iteration: out.loop_iterations,
        max_iter: step.microloop.as_ref().map(|m| m.max_iter).unwrap_or(0),
        signatures: tracker,
        last_signature: out.last_signature.as_deref(),
        detour_attempts,
        rebase_needed: false,
        forensics,
    };
    decide(&input, &kernel.detours, kernel.navigator.as_ref())
}

#[allow(clippy::too_many_arguments)]
fn run_detour(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    target: &str,
    entry: &SkillEntry,
    step_deadline: &Deadline,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    reporter.warn(&format!(
        "{}/{}: detouring through {target}",
        flow.flow_key, step.step_id
    ));

    let tool_limit = entry.timeout.unwrap_or(kernel.timeouts.tool.hard);
    let tool_deadline = step_deadline.child(tool_limit);
    let out_dir = kernel.ledger.flow_dir(run_id, &flow.flow_key).join("logs");

    let result = run_skill(target, &entry.spec, &out_dir, &step.step_id, &tool_deadline);
    let (exit_code, signature) = match &result {
        Ok(outcome) => (outcome.exit_code, String::new()),
        Err(raw) => (raw.exit_code.unwrap_or(-1), derive_signature("detour", &raw.message)),
    };

    kernel
        .ledger
        .append_step_log(
            run_id,
            &flow.flow_key,
            &step.step_id,
            &StepLogEntry::DetourRun {
                signature,
                target: target.to_string(),
                exit_code,
                at: Utc::now(),
            },
        )
        .ok();

    if let Ok(outcome) = &result {
        if !outcome.success() {
            kernel.ledger.append_degradation(
                run_id,
                &flow.flow_key,
                &Degradation {
                    at: Utc::now(),
                    step: step.step_id.clone(),
                    category: "detour_failed".to_string(),
                    message: format!("detour {target} exited {}", outcome.exit_code),
                    remediation: format!("inspect {}", outcome.stderr_path.display()),
                },
            )?;
        }
    }
    Ok(())
}

// ---- work phase -----------------------------------------------------------

fn execute_step_work(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    step_deadline: &Deadline,
    cancel: &CancelToken,
    tracker: &mut SignatureTracker,
) -> Result<WorkResult> {
    if let Some(skill_name) = &step.skill {
        return execute_skill_step(kernel, run_id, flow, step, skill_name, step_deadline, cancel, tracker);
    }
    if step.microloop.is_some() {
        return execute_microloop_step(kernel, run_id, flow, step, step_deadline, cancel, tracker);
    }
    execute_agent_step(kernel, run_id, flow, step, step_deadline, cancel, tracker)
}

fn minimal_meta(flow: &FlowSpec, step: &StepSpec) -> HandoffMeta {
    HandoffMeta {
        step_id: step.step_id.clone(),
        agent_key: step.agent_key.clone(),
        flow_key: flow.flow_key.clone(),
    }
}

/// Shape of a structured handoff payload as backends emit it: the envelope
/// minus meta and schema version, which the kernel stamps.
#[derive(Debug, Deserialize)]
struct PartialHandoff {
    status: HandoffStatus,
    #[serde(default)]
    summary: HandoffSummary,
    #[serde(default)]
    concerns: Vec<Concern>,
    #[serde(default)]
    assumptions: Vec<String>,
    #[serde(default)]
    routing: Option<RoutingHint>,
}

/// FINALIZE: build the handoff envelope from a backend's structured output.
/// Ambiguity is an assumption plus `UNVERIFIED`, never a guess.
fn finalize_handoff(
    meta: HandoffMeta,
    structured: Option<&serde_json::Value>,
) -> Handoff {
    if let Some(value) = structured {
        if let Ok(partial) = serde_json::from_value::<PartialHandoff>(value.clone()) {
            return Handoff {
                schema_version: CURRENT_HANDOFF_VERSION.to_string(),
                meta,
                status: partial.status,
                summary: partial.summary,
                concerns: partial.concerns,
                assumptions: partial.assumptions,
                routing: partial.routing.unwrap_or_default(),
            };
        }
    }

    let mut handoff = Handoff::minimal(meta, HandoffStatus::Unverified, "step executed");
    handoff
        .assumptions
        .push("backend produced no parseable structured handoff".to_string());
    handoff
}

fn failure_handoff(meta: HandoffMeta, classified: &Classified) -> Handoff {
    let status = if classified.category == ErrorCategory::Permanent
        && classified.message.to_lowercase().contains("missing required")
    {
        HandoffStatus::Blocked
    } else {
        HandoffStatus::Unverified
    };

    let mut handoff = Handoff::minimal(meta, status, "step failed");
    handoff.concerns.push(Concern {
        severity: classified.category.as_str().to_string(),
        description: classified.message.clone(),
        location: "step execution".to_string(),
        recommendation: "see step log for attempts".to_string(),
    });
    handoff.routing = RoutingHint {
        recommendation: "ESCALATE".to_string(),
        can_further_iteration_help: false,
        reason: classified.signature.clone(),
    };
    handoff
}

#[allow(clippy::too_many_arguments)]
fn execute_skill_step(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    skill_name: &str,
    step_deadline: &Deadline,
    cancel: &CancelToken,
    tracker: &mut SignatureTracker,
) -> Result<WorkResult> {
    let started_at = Utc::now();
    let start = Instant::now();
    let meta = minimal_meta(flow, step);

    let Some(entry) = kernel.skills.get(skill_name) else {
        // A step naming an unregistered skill is a literal missing input.
        let classified = Classified {
            category: ErrorCategory::Permanent,
            message: format!("missing required skill: {skill_name}"),
            signature: derive_signature("skill", skill_name),
            retry_after_ms: None,
        };
        tracker.record(&classified.signature);
        let handoff = failure_handoff(meta, &classified);
        return Ok(WorkResult::Done(Box::new(WorkOutput {
            started_at,
            completed_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            status: StepStatus::Failed,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            exit_code: None,
            evidence: vec![],
            overflow: vec![],
            timeout_event: None,
            last_signature: Some(classified.signature.clone()),
            handoff,
            failure: Some(classified),
            loop_iterations: 0,
            loop_exit: None,
        })));
    };

    let tool_limit = entry.timeout.unwrap_or(kernel.timeouts.tool.hard);
    let tool_deadline = step_deadline.child(tool_limit);
    let out_dir = kernel.ledger.flow_dir(run_id, &flow.flow_key).join("logs");
    let target = format!("skill:{skill_name}");

    let outcome = execute_with_retries(
        &kernel.breakers,
        &target,
        &tool_deadline,
        cancel,
        |_| run_skill(skill_name, &entry.spec, &out_dir, &step.step_id, &tool_deadline),
        |notice| {
            kernel
                .ledger
                .append_step_log(
                    run_id,
                    &flow.flow_key,
                    &step.step_id,
                    &StepLogEntry::Retry {
                        category: notice.category.as_str().to_string(),
                        retry_count: notice.retry_count,
                        delay_ms: notice.delay.as_millis() as u64,
                        at: Utc::now(),
                    },
                )
                .ok();
        },
    );

    let completed_at = Utc::now();
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        CallOutcome::Success { value: skill_out, .. } => {
            let evidence = vec![skill_out.stdout_path.clone(), skill_out.stderr_path.clone()];
            if skill_out.timed_out {
                let mut handoff =
                    Handoff::minimal(meta, HandoffStatus::Unverified, "skill timed out");
                handoff.routing.can_further_iteration_help = false;
                return Ok(WorkResult::Done(Box::new(WorkOutput {
                    started_at,
                    completed_at,
                    duration_ms,
                    status: StepStatus::Timeout,
                    tokens: TokenUsage::default(),
                    cost_usd: 0.0,
                    exit_code: Some(skill_out.exit_code),
                    evidence,
                    overflow: vec![],
                    timeout_event: Some("tool".to_string()),
                    handoff,
                    failure: None,
                    last_signature: None,
                    loop_iterations: 0,
                    loop_exit: None,
                })));
            }

            if skill_out.success() {
                let mut handoff = Handoff::minimal(
                    meta,
                    HandoffStatus::Verified,
                    &format!("skill {skill_name} exited 0"),
                );
                handoff.summary.evidence.insert(
                    format!("{skill_name}_stdout"),
                    format!("{}@{}", skill_out.stdout_path.display(), kernel.commit_sha),
                );
                Ok(WorkResult::Done(Box::new(WorkOutput {
                    started_at,
                    completed_at,
                    duration_ms,
                    status: StepStatus::Succeeded,
                    tokens: TokenUsage::default(),
                    cost_usd: 0.0,
                    exit_code: Some(skill_out.exit_code),
                    evidence,
                    overflow: vec![],
                    timeout_event: None,
                    handoff,
                    failure: None,
                    last_signature: None,
                    loop_iterations: 0,
                    loop_exit: None,
                })))
            } else {
                // Derive the failure signature from the first stderr line so
                // repeated identical failures can hit the detour catalog.
                let stderr_head = std::fs::read_to_string(&skill_out.stderr_path)
                    .ok()
                    .and_then(|s| s.lines().find(|l| !l.trim().is_empty()).map(String::from))
                    .unwrap_or_else(|| format!("skill {skill_name} failed"));
                let signature = derive_signature(&format!("skill:{skill_name}"), &stderr_head);
                tracker.record(&signature);

                let classified = Classified {
                    category: ErrorCategory::Retriable,
                    message: format!("skill {skill_name} exited {}", skill_out.exit_code),
                    signature: signature.clone(),
                    retry_after_ms: None,
                };
                let mut handoff = failure_handoff(meta, &classified);
                handoff.concerns[0].location = stderr_head;

                Ok(WorkResult::Done(Box::new(WorkOutput {
                    started_at,
                    completed_at,
                    duration_ms,
                    status: StepStatus::Failed,
                    tokens: TokenUsage::default(),
                    cost_usd: 0.0,
                    exit_code: Some(skill_out.exit_code),
                    evidence,
                    overflow: vec![],
                    timeout_event: None,
                    handoff,
                    failure: Some(classified),
                    last_signature: Some(signature),
                    loop_iterations: 0,
                    loop_exit: None,
                })))
            }
        }
        CallOutcome::Failed(classified) => {
            tracker.record(&classified.signature);
            let handoff = failure_handoff(meta, &classified);
            Ok(WorkResult::Done(Box::new(WorkOutput {
                started_at,
                completed_at,
                duration_ms,
                status: StepStatus::Failed,
                tokens: TokenUsage::default(),
                cost_usd: 0.0,
                exit_code: None,
                evidence: vec![],
                overflow: vec![],
                timeout_event: None,
                last_signature: Some(classified.signature.clone()),
                handoff,
                failure: Some(classified),
                loop_iterations: 0,
                loop_exit: None,
            })))
        }
        CallOutcome::FastFailed { target } => Ok(WorkResult::FastFailed { target }),
        CallOutcome::BreakerEscalate { target, last } => {
            Ok(WorkResult::BreakerEscalate { target, last })
        }
        CallOutcome::TimedOut => Ok(timeout_work(started_at, start, meta, "tool")),
        CallOutcome::Cancelled => Ok(WorkResult::Cancelled),
    }
}

fn timeout_work(
    started_at: DateTime<Utc>,
    start: Instant,
    meta: HandoffMeta,
    scope: &str,
) -> WorkResult {
    let mut handoff = Handoff::minimal(meta, HandoffStatus::Unverified, "deadline elapsed");
    handoff
        .assumptions
        .push(format!("{scope} deadline elapsed before completion"));
    handoff.routing.can_further_iteration_help = false;
    WorkResult::Done(Box::new(WorkOutput {
        started_at,
        completed_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
        status: StepStatus::Interrupted,
        tokens: TokenUsage::default(),
        cost_usd: 0.0,
        exit_code: None,
        evidence: vec![],
        overflow: vec![],
        timeout_event: Some(scope.to_string()),
        handoff,
        failure: None,
        last_signature: None,
        loop_iterations: 0,
        loop_exit: None,
    }))
}

/// Assemble the prompt pack for one role of one step.
fn build_pack(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    role: &str,
    extra_high: Option<(&str, String)>,
) -> PackOutcome {
    let mut items = vec![ContextItem::new(
        "step_spec",
        Priority::Critical,
        serde_json::to_string_pretty(&serde_json::json!({
            "flow": flow.flow_key,
            "goal": flow.goal,
            "exit_criteria": flow.exit_criteria,
            "non_goals": flow.non_goals,
            "step": step,
        }))
        .unwrap_or_default(),
    )];

    if let Some((label, text)) = extra_high {
        items.push(ContextItem::new(label, Priority::High, text));
    } else if let Some(dep) = step.depends_on.last() {
        if let Some(dep_step) = flow.step(dep) {
            if let Ok(Some(handoff)) =
                kernel
                    .ledger
                    .read_handoff(run_id, &flow.flow_key, dep, &dep_step.agent_key)
            {
                items.push(ContextItem::new(
                    "upstream_handoff",
                    Priority::High,
                    serde_json::to_string_pretty(&handoff.summary).unwrap_or_default(),
                ));
            }
        }
    }

    if let Ok(trail) = kernel.ledger.scent_trail(run_id, &flow.flow_key) {
        if !trail.is_empty() {
            let excerpt: Vec<String> = trail
                .iter()
                .rev()
                .take(5)
                .map(|e| format!("{} {:?} {}", e.step, e.decision, e.rationale))
                .collect();
            items.push(ContextItem::new(
                "scent_trail",
                Priority::Low,
                excerpt.join("\n"),
            ));
        }
    }

    let needs_schema = !kernel.backend.descriptor().has(Capability::StructuredOutput);
    crate::context::pack(role, items, RoleBudget::for_role(role), needs_schema)
}

/// Reliability-wrapped backend call for one role of one step.
#[allow(clippy::too_many_arguments)]
fn backend_call(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    agent_key: &str,
    pack: &crate::context::PromptPack,
    step_deadline: &Deadline,
    cancel: &CancelToken,
) -> CallOutcome<crate::types::StepResult> {
    let call_deadline = step_deadline.child(kernel.timeouts.call.hard);
    let workdir = kernel.ledger.flow_dir(run_id, &flow.flow_key).join("llm");
    let target = format!("backend:{}", kernel.backend.descriptor().engine);

    execute_with_retries(
        &kernel.breakers,
        &target,
        &call_deadline,
        cancel,
        |attempt| {
            kernel
                .ledger
                .append_step_log(
                    run_id,
                    &flow.flow_key,
                    &step.step_id,
                    &StepLogEntry::Attempt {
                        attempt,
                        at: Utc::now(),
                    },
                )
                .ok();
            kernel
                .backend
                .execute(step, agent_key, pack, &workdir, &call_deadline, cancel)
        },
        |notice| {
            kernel
                .ledger
                .append_step_log(
                    run_id,
                    &flow.flow_key,
                    &step.step_id,
                    &StepLogEntry::Retry {
                        category: notice.category.as_str().to_string(),
                        retry_count: notice.retry_count,
                        delay_ms: notice.delay.as_millis() as u64,
                        at: Utc::now(),
                    },
                )
                .ok();
        },
    )
}

fn execute_agent_step(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    step_deadline: &Deadline,
    cancel: &CancelToken,
    tracker: &mut SignatureTracker,
) -> Result<WorkResult> {
    let started_at = Utc::now();
    let start = Instant::now();
    let meta = minimal_meta(flow, step);

    let pack_outcome = build_pack(kernel, run_id, flow, step, &step.agent_key, None);
    let outcome = backend_call(
        kernel,
        run_id,
        flow,
        step,
        &step.agent_key,
        &pack_outcome.pack,
        step_deadline,
        cancel,
    );

    let completed_at = Utc::now();
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        CallOutcome::Success { value, .. } => {
            let handoff = finalize_handoff(meta, value.structured_output.as_ref());
            let evidence = value.output_text_path.clone().into_iter().collect();
            Ok(WorkResult::Done(Box::new(WorkOutput {
                started_at,
                completed_at,
                duration_ms,
                status: value.status,
                tokens: value.tokens,
                cost_usd: value.cost_usd,
                exit_code: value.exit_code,
                evidence,
                overflow: pack_outcome.overflow,
                timeout_event: None,
                handoff,
                failure: None,
                last_signature: None,
                loop_iterations: 0,
                loop_exit: None,
            })))
        }
        CallOutcome::Failed(classified) => {
            tracker.record(&classified.signature);
            let handoff = failure_handoff(meta, &classified);
            Ok(WorkResult::Done(Box::new(WorkOutput {
                started_at,
                completed_at,
                duration_ms,
                status: StepStatus::Failed,
                tokens: TokenUsage::default(),
                cost_usd: 0.0,
                exit_code: None,
                evidence: vec![],
                overflow: pack_outcome.overflow,
                timeout_event: None,
                last_signature: Some(classified.signature.clone()),
                handoff,
                failure: Some(classified),
                loop_iterations: 0,
                loop_exit: None,
            })))
        }
        CallOutcome::FastFailed { target } => Ok(WorkResult::FastFailed { target }),
        CallOutcome::BreakerEscalate { target, last } => {
            Ok(WorkResult::BreakerEscalate { target, last })
        }
        CallOutcome::TimedOut => Ok(timeout_work(started_at, start, meta, "call")),
        CallOutcome::Cancelled => Ok(WorkResult::Cancelled),
    }
}

fn execute_microloop_step(
    kernel: &Kernel,
    run_id: &str,
    flow: &FlowSpec,
    step: &StepSpec,
    step_deadline: &Deadline,
    cancel: &CancelToken,
    tracker: &mut SignatureTracker,
) -> Result<WorkResult> {
    let spec = step
        .microloop
        .as_ref()
        .context("microloop step without microloop spec")?;
    let partner = spec.partner_agent_key.clone();
    let started_at = Utc::now();
    let start = Instant::now();

    let mut tokens = TokenUsage::default();
    let mut cost_usd = 0.0_f64;
    let mut evidence: Vec<PathBuf> = Vec::new();
    let mut overflow: Vec<String> = Vec::new();
    let mut aborted: Option<CallOutcome<crate::types::StepResult>> = None;
    let mut last_author_summary = String::new();

    let loop_result = run_microloop(spec.max_iter, |role, state| {
        let (agent_key, role_meta) = match role {
            LoopRole::Author => (step.agent_key.clone(), minimal_meta(flow, step)),
            LoopRole::Critic => (
                partner.clone(),
                HandoffMeta {
                    step_id: step.step_id.clone(),
                    agent_key: partner.clone(),
                    flow_key: flow.flow_key.clone(),
                },
            ),
        };

        // The critic's HIGH item is the author's minimal envelope, never
        // the raw transcript.
        let extra = match role {
            LoopRole::Author => None,
            LoopRole::Critic => Some(("author_handoff", last_author_summary.clone())),
        };
        let pack_outcome = build_pack(kernel, run_id, flow, step, &agent_key, extra);
        overflow.extend(pack_outcome.overflow.iter().cloned());

        let outcome = backend_call(
            kernel,
            run_id,
            flow,
            step,
            &agent_key,
            &pack_outcome.pack,
            step_deadline,
            cancel,
        );

        match outcome {
            CallOutcome::Success { value, .. } => {
                tokens.add(&value.tokens);
                cost_usd += value.cost_usd;
                if let Some(path) = &value.output_text_path {
                    evidence.push(path.clone());
                }
                let handoff = finalize_handoff(role_meta, value.structured_output.as_ref());
                if role == LoopRole::Author {
                    last_author_summary =
                        serde_json::to_string_pretty(&handoff.summary).unwrap_or_default();
                }
                if role == LoopRole::Critic {
                    kernel
                        .ledger
                        .append_step_log(
                            run_id,
                            &flow.flow_key,
                            &step.step_id,
                            &StepLogEntry::LoopIteration {
                                iter: state.iter,
                                critic_status: handoff.status,
                                at: Utc::now(),
                            },
                        )
                        .ok();
                }
                Ok((value, handoff))
            }
            other => {
                aborted = Some(other);
                Err(anyhow!("microloop call aborted"))
            }
        }
    });

    let completed_at = Utc::now();
    let duration_ms = start.elapsed().as_millis() as u64;
    let meta = minimal_meta(flow, step);

    match loop_result {
        Ok(outcome) => {
            // Surface repeated signatures to routing as two occurrences.
            let last_signature = match &outcome.exit {
                LoopExit::RepeatedSignature(sig) => {
                    tracker.record(sig);
                    tracker.record(sig);
                    Some(sig.clone())
                }
                _ => None,
            };

            Ok(WorkResult::Done(Box::new(WorkOutput {
                started_at,
                completed_at,
                duration_ms,
                status: StepStatus::Succeeded,
                tokens,
                cost_usd,
                exit_code: None,
                evidence,
                overflow,
                timeout_event: None,
                handoff: outcome.final_handoff.clone(),
                failure: None,
                last_signature,
                loop_iterations: outcome.iterations,
                loop_exit: Some(outcome.exit),
            })))
        }
        Err(_) => match aborted {
            Some(CallOutcome::Failed(classified)) => {
                tracker.record(&classified.signature);
                let handoff = failure_handoff(meta, &classified);
                Ok(WorkResult::Done(Box::new(WorkOutput {
                    started_at,
                    completed_at,
                    duration_ms,
                    status: StepStatus::Failed,
                    tokens,
                    cost_usd,
                    exit_code: None,
                    evidence,
                    overflow,
                    timeout_event: None,
                    last_signature: Some(classified.signature.clone()),
                    handoff,
                    failure: Some(classified),
                    loop_iterations: 0,
                    loop_exit: None,
                })))
            }
            Some(CallOutcome::FastFailed { target }) => Ok(WorkResult::FastFailed { target }),
            Some(CallOutcome::BreakerEscalate { target, last }) => {
                Ok(WorkResult::BreakerEscalate { target, last })
            }
            Some(CallOutcome::TimedOut) => Ok(timeout_work(started_at, start, meta, "call")),
            Some(CallOutcome::Cancelled) | None => Ok(WorkResult::Cancelled),
            Some(CallOutcome::Success { .. }) => {
                anyhow::bail!("microloop aborted with a success outcome")
            }
        },
    }
}
