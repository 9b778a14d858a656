//! The run supervisor: drives flows in order, owns run-level budget and
//! terminal status transitions, and surfaces escalations.
//!
//! The supervisor is the only component that moves a run to a terminal
//! status. Everything below it reports typed outcomes; nothing throws its
//! way across a component boundary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::{CliBackend, SdkBackend, StubBackend};
use crate::budget::{CostMeter, TimeoutPolicy};
use crate::cancel::RunControl;
use crate::config::Config;
use crate::gate::{GateViolation, PublishRequest, check as gate_check};
use crate::ledger::Ledger;
use crate::lock::RunLock;
use crate::plan::FlowRegistry;
use crate::reliability::BreakerRegistry;
use crate::report::Reporter;
use crate::routing::{DetourCatalog, HttpNavigator, Navigator, StaticNavigator};
use crate::scheduler::{FlowOutcome, Kernel, run_flow};
use crate::skill::SkillRegistry;
use crate::types::{
    CURRENT_META_VERSION, Decision, EngineMode, EnvironmentFingerprint, Escalation,
    EscalationResolution, KernelEvent, KernelEventKind, RunMeta, RunSpec, RunStatus,
};

/// Injected-flow ceiling per run; beyond it the run escalates instead of
/// looping through resets forever.
const INJECTION_LIMIT: u32 = 3;

/// Escalation/abort notification target.
pub struct Notifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl Notifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build notifier client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Best-effort: notification failures degrade, they never fail the run.
    fn notify(&self, payload: &serde_json::Value) -> bool {
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Per-flow slice of a run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowReport {
    pub flow_key: String,
    pub committed_steps: Vec<String>,
    pub receipts: usize,
    pub degradations: usize,
    pub routing_decisions: usize,
    /// Acceptance-criteria IDs covered by succeeded receipts.
    pub ac_covered: Vec<String>,
}

/// Read-only projection of a run, for the CLI and the status server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub flows: Vec<FlowReport>,
    pub open_escalations: Vec<Escalation>,
}

/// Orchestrates whole runs over the kernel.
pub struct Supervisor {
    kernel: Arc<Kernel>,
    flows: FlowRegistry,
    lock_stale_after: Duration,
    notifier: Option<Notifier>,
    controls: Mutex<BTreeMap<String, RunControl>>,
}

impl Supervisor {
    pub fn new(kernel: Arc<Kernel>, flows: FlowRegistry) -> Self {
        Self {
            kernel,
            flows,
            lock_stale_after: Duration::from_secs(3600),
            notifier: None,
            controls: Mutex::new(BTreeMap::new()),
        }
    }

    /// Assemble a supervisor (kernel included) from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let kernel = build_kernel(config)?;
        let mut flows = FlowRegistry::builtin();
        for flow in &config.flows {
            flows.insert(flow.clone())?;
        }

        let mut supervisor = Self::new(Arc::new(kernel), flows);
        supervisor.lock_stale_after = config.lock_stale_after();
        if let Some(webhook) = &config.webhook {
            supervisor.notifier = Some(Notifier::new(
                webhook.url.clone(),
                Duration::from_secs(webhook.timeout_secs),
            )?);
        }
        Ok(supervisor)
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    // ---- lifecycle --------------------------------------------------------

    /// Validate a run spec and persist its pending meta. Returns the run
    /// id; the run is driven separately.
    pub fn prepare_run(&self, spec: RunSpec) -> Result<String> {
        if spec.flows.is_empty() {
            bail!("run spec declares no flows");
        }
        for flow_key in &spec.flows {
            self.flows.resolve(flow_key)?;
        }
        if spec.budget_usd <= 0.0 {
            bail!("run budget must be positive");
        }

        let run_id = generate_run_id();
        let meta = RunMeta {
            schema_version: CURRENT_META_VERSION.to_string(),
            run_id: run_id.clone(),
            spec,
            created_at: Utc::now(),
            status: RunStatus::Pending,
            cumulative_cost: 0.0,
            active_flow: None,
            abort_reason: None,
            notified: false,
            environment: EnvironmentFingerprint::collect(),
        };
        self.kernel
            .ledger
            .write_meta(&meta)
            .map_err(|e| anyhow::anyhow!("failed to create run meta: {e}"))?;
        Ok(run_id)
    }

    /// Drive a prepared run to its first stop.
    pub fn drive_run(&self, run_id: &str, reporter: &mut dyn Reporter) -> Result<RunReport> {
        self.drive(run_id, reporter)
    }

    /// Create and drive a new run to its first stop.
    pub fn start_run(&self, spec: RunSpec, reporter: &mut dyn Reporter) -> Result<RunReport> {
        let run_id = self.prepare_run(spec)?;
        reporter.info(&format!("run {run_id}: created"));
        self.drive(&run_id, reporter)
    }

    /// Resume a run from its last checkpoint.
    pub fn resume(&self, run_id: &str, reporter: &mut dyn Reporter) -> Result<RunReport> {
        let meta = self
            .kernel
            .ledger
            .read_meta(run_id)?
            .with_context(|| format!("no existing run state for {run_id}"))?;
        if meta.status.is_terminal() {
            bail!("run {run_id} is {:?}; nothing to resume", meta.status);
        }

        let escalations = self.kernel.ledger.escalations(run_id)?;
        let unresolved: Vec<&Escalation> = escalations
            .iter()
            .filter(|e| e.resolution.is_none())
            .collect();
        if !unresolved.is_empty() {
            bail!(
                "run {run_id} has {} unresolved escalation(s); resolve before resuming (first: {})",
                unresolved.len(),
                unresolved[0].key
            );
        }

        // Apply resolutions that carry run-level meaning.
        for escalation in &escalations {
            if let Some(resolution) = &escalation.resolution {
                match resolution.decision {
                    Decision::Terminate => {
                        let mut meta = meta.clone();
                        return self.finish_aborted(
                            &mut meta,
                            "terminated_by_operator",
                            reporter,
                        );
                    }
                    // Continue, Loop, Detour, InjectFlow: the scheduler
                    // retries uncommitted steps on its own; injected resets
                    // ride the normal inject path.
                    _ => {}
                }
            }
        }

        reporter.info(&format!("run {run_id}: resuming from last checkpoint"));
        self.drive(run_id, reporter)
    }

    fn drive(&self, run_id: &str, reporter: &mut dyn Reporter) -> Result<RunReport> {
        let run_root = self.kernel.ledger.run_root(run_id);
        let _lock = RunLock::acquire(&run_root, run_id, self.lock_stale_after)
            .context("failed to acquire run lock")?;

        let control = self.register_control(run_id);

        let mut meta = self
            .kernel
            .ledger
            .read_meta(run_id)?
            .with_context(|| format!("run meta missing for {run_id}"))?;

        let resumed = meta.status == RunStatus::Paused || meta.status == RunStatus::Escalated;
        meta.status = RunStatus::Running;
        self.write_meta(&meta)?;
        if resumed {
            self.kernel
                .ledger
                .append_event(run_id, &KernelEvent::now(KernelEventKind::Resume))?;
        }

        let mut meter = CostMeter::resumed(meta.spec.budget_usd, meta.cumulative_cost);
        let mut queue: VecDeque<String> = meta.spec.flows.iter().cloned().collect();
        let mut injections = 0u32;

        while let Some(flow_key) = queue.pop_front() {
            let flow = self.flows.resolve(&flow_key)?.clone();
            meta.active_flow = Some(flow_key.clone());
            self.write_meta(&meta)?;

            let outcome = run_flow(&self.kernel, &mut meta, &mut meter, &flow, &control, reporter)?;
            match outcome {
                FlowOutcome::Completed => {
                    reporter.info(&format!("run {run_id}: flow {flow_key} completed"));
                }
                FlowOutcome::Escalated { step_id, reason } => {
                    return self.finish_escalated(&mut meta, &flow_key, &step_id, &reason, reporter);
                }
                FlowOutcome::Terminated { step_id, reason } => {
                    // Boundary violations preserve state for a human; other
                    // fatal causes abort.
                    self.kernel.ledger.forensics_snapshot(
                        run_id,
                        &flow_key,
                        "fatal",
                        &serde_json::json!({"step": step_id, "reason": reason}),
                    )?;
                    if reason.contains("boundary violation") {
                        return self.finish_escalated(
                            &mut meta, &flow_key, &step_id, &reason, reporter,
                        );
                    }
                    return self.finish_aborted(&mut meta, &reason, reporter);
                }
                FlowOutcome::InjectFlow { flow_key: injected } => {
                    injections += 1;
                    if injections > INJECTION_LIMIT {
                        return self.finish_escalated(
                            &mut meta,
                            &flow_key,
                            "",
                            "injection_limit_exceeded",
                            reporter,
                        );
                    }
                    self.flows.resolve(&injected)?;
                    reporter.warn(&format!(
                        "run {run_id}: injecting flow {injected} before retrying {flow_key}"
                    ));
                    queue.push_front(flow_key.clone());
                    queue.push_front(injected);
                }
                FlowOutcome::BudgetExhausted => {
                    return self.finish_aborted(&mut meta, "budget_exhausted", reporter);
                }
                FlowOutcome::Paused | FlowOutcome::Cancelled => {
                    meta.status = RunStatus::Paused;
                    self.write_meta(&meta)?;
                    self.kernel
                        .ledger
                        .append_event(&meta.run_id, &KernelEvent::now(KernelEventKind::Pause))?;
                    reporter.warn(&format!("run {run_id}: paused; resumable"));
                    return self.report(run_id);
                }
                FlowOutcome::TimedOut => {
                    return self.finish_escalated(
                        &mut meta,
                        &flow_key,
                        "",
                        "flow_deadline_elapsed",
                        reporter,
                    );
                }
            }
        }

        meta.status = RunStatus::Completed;
        meta.active_flow = None;
        self.write_meta(&meta)?;
        reporter.info(&format!("run {run_id}: completed"));
        self.report(run_id)
    }

    fn finish_escalated(
        &self,
        meta: &mut RunMeta,
        flow_key: &str,
        step_id: &str,
        reason: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<RunReport> {
        let key = format!("esc-{}-{}", flow_key, if step_id.is_empty() { "flow" } else { step_id });
        self.kernel.ledger.append_escalation(
            &meta.run_id,
            &Escalation {
                key: key.clone(),
                flow_key: flow_key.to_string(),
                step_id: step_id.to_string(),
                reason: reason.to_string(),
                raised_at: Utc::now(),
                resolution: None,
            },
        )?;
        self.kernel.ledger.append_event(
            &meta.run_id,
            &KernelEvent::now(KernelEventKind::Escalated {
                key: key.clone(),
                reason: reason.to_string(),
            }),
        )?;

        meta.status = RunStatus::Escalated;
        meta.notified = self.send_notification(&meta.run_id, "escalated", reason);
        self.write_meta(meta)?;
        reporter.error(&format!(
            "run {}: escalated at {flow_key}/{step_id}: {reason}",
            meta.run_id
        ));
        self.report(&meta.run_id)
    }

    fn finish_aborted(
        &self,
        meta: &mut RunMeta,
        reason: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<RunReport> {
        self.kernel.ledger.append_event(
            &meta.run_id,
            &KernelEvent::now(KernelEventKind::Abort {
                reason: reason.to_string(),
            }),
        )?;
        meta.status = RunStatus::Aborted;
        meta.abort_reason = Some(reason.to_string());
        meta.notified = self.send_notification(&meta.run_id, "aborted", reason);
        self.write_meta(meta)?;
        reporter.error(&format!("run {}: aborted: {reason}", meta.run_id));
        self.report(&meta.run_id)
    }

    fn send_notification(&self, run_id: &str, status: &str, reason: &str) -> bool {
        match &self.notifier {
            Some(notifier) => notifier.notify(&serde_json::json!({
                "run_id": run_id,
                "status": status,
                "reason": reason,
                "at": Utc::now(),
            })),
            None => false,
        }
    }

    fn write_meta(&self, meta: &RunMeta) -> Result<()> {
        self.kernel
            .ledger
            .write_meta(meta)
            .map_err(|e| anyhow::anyhow!("meta write failed: {e}"))
    }

    // ---- controls ---------------------------------------------------------

    /// A fresh drive always starts unpaused and uncancelled.
    fn register_control(&self, run_id: &str) -> RunControl {
        let control = RunControl::new();
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls.insert(run_id.to_string(), control.clone());
        control
    }

    /// The live control handle for an in-process run, if any.
    pub fn control(&self, run_id: &str) -> Option<RunControl> {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls.get(run_id).cloned()
    }

    /// Forbid new step starts; in-flight steps commit or time out first.
    pub fn pause(&self, run_id: &str) -> Result<()> {
        let control = self
            .control(run_id)
            .with_context(|| format!("run {run_id} is not active in this process"))?;
        control.pause();
        Ok(())
    }

    /// Interrupt in-flight calls. The run stays resumable.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let control = self
            .control(run_id)
            .with_context(|| format!("run {run_id} is not active in this process"))?;
        control.cancel();
        Ok(())
    }

    /// Resolve an escalation by injecting a vocabulary decision.
    pub fn resolve_escalation(
        &self,
        run_id: &str,
        key: &str,
        decision: Decision,
        note: &str,
    ) -> Result<Escalation> {
        self.kernel.ledger.resolve_escalation(
            run_id,
            key,
            EscalationResolution {
                decision,
                at: Utc::now(),
                note: note.to_string(),
            },
        )
    }

    // ---- boundary ---------------------------------------------------------

    /// Gate an external mutation. A violation is fatal: forensics snapshot,
    /// escalation, notification, and the run moves to `escalated`.
    pub fn guard_publish(
        &self,
        run_id: &str,
        flow_key: &str,
        request: &PublishRequest<'_>,
    ) -> Result<std::result::Result<(), GateViolation>> {
        match gate_check(request, &self.kernel.gate_policy) {
            Ok(()) => Ok(Ok(())),
            Err(violation) => {
                let classified = violation.to_classified();
                self.kernel.ledger.forensics_snapshot(
                    run_id,
                    flow_key,
                    "boundary-violation",
                    &serde_json::json!({
                        "violation": violation.to_string(),
                        "signature": classified.signature,
                    }),
                )?;

                let mut meta = self
                    .kernel
                    .ledger
                    .read_meta(run_id)?
                    .with_context(|| format!("run meta missing for {run_id}"))?;
                let mut sink = crate::report::NullReporter;
                self.finish_escalated(
                    &mut meta,
                    flow_key,
                    "publish",
                    &classified.message,
                    &mut sink,
                )?;
                Ok(Err(violation))
            }
        }
    }

    // ---- projections ------------------------------------------------------

    /// Build the read-only report for a run from the ledger.
    pub fn report(&self, run_id: &str) -> Result<RunReport> {
        let meta = self
            .kernel
            .ledger
            .read_meta(run_id)?
            .with_context(|| format!("no existing run state for {run_id}"))?;

        let mut flows = Vec::new();
        for flow_key in &meta.spec.flows {
            let listing = self.kernel.ledger.list_receipts(run_id, flow_key)?;
            let mut ac_covered: Vec<String> = listing
                .receipts
                .iter()
                .filter(|r| r.status == crate::types::StepStatus::Succeeded)
                .flat_map(|r| r.ac_ids.iter().cloned())
                .collect();
            ac_covered.sort();
            ac_covered.dedup();
            flows.push(FlowReport {
                flow_key: flow_key.clone(),
                committed_steps: listing.receipts.iter().map(|r| r.step_id.clone()).collect(),
                receipts: listing.receipts.len(),
                degradations: self.kernel.ledger.degradations(run_id, flow_key)?.len(),
                routing_decisions: self.kernel.ledger.routing_decisions(run_id, flow_key)?.len(),
                ac_covered,
            });
        }

        let open_escalations = self
            .kernel
            .ledger
            .escalations(run_id)?
            .into_iter()
            .filter(|e| e.resolution.is_none())
            .collect();

        Ok(RunReport {
            meta,
            flows,
            open_escalations,
        })
    }

    /// Summaries of every run under the ledger base.
    pub fn list_runs(&self) -> Result<Vec<RunMeta>> {
        let base = self.kernel.ledger.base();
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(base)
            .with_context(|| format!("io error reading {}", base.display()))?
        {
            let entry = entry.context("io error listing runs")?;
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            if let Some(meta) = self.kernel.ledger.read_meta(&run_id)? {
                runs.push(meta);
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

/// Assemble a kernel from configuration.
pub fn build_kernel(config: &Config) -> Result<Kernel> {
    let backend: Arc<dyn crate::backend::Backend> = match config.kernel.mode {
        EngineMode::Stub => Arc::new(StubBackend::new()),
        EngineMode::Cli => {
            let settings = config
                .backend
                .cli
                .as_ref()
                .context("mode cli requires a [backend.cli] section")?;
            Arc::new(CliBackend::new(settings.command()))
        }
        EngineMode::Sdk => {
            let settings = config
                .backend
                .sdk
                .as_ref()
                .context("mode sdk requires a [backend.sdk] section")?;
            Arc::new(
                SdkBackend::new(settings.url.clone(), settings.token_env.clone())
                    .map_err(|e| anyhow::anyhow!("failed to build sdk backend: {}", e.message))?,
            )
        }
    };

    let navigator: Arc<dyn Navigator> = match &config.navigator {
        Some(settings) => Arc::new(HttpNavigator::new(
            settings.url.clone(),
            settings.model.clone(),
        )?),
        // Escalate on doubt when no advisor is configured.
        None => Arc::new(StaticNavigator {
            answer: "ESCALATE".to_string(),
        }),
    };

    let mut skills = SkillRegistry::new();
    for (name, settings) in &config.skills {
        skills.register(name.clone(), settings.command(), settings.timeout);
    }

    Ok(Kernel {
        ledger: Ledger::new(config.kernel.run_base.clone()),
        backend,
        navigator,
        skills,
        detours: DetourCatalog {
            rules: config.detours.clone(),
        },
        breakers: BreakerRegistry::new(),
        timeouts: TimeoutPolicy::default(),
        gate_policy: config.gate.clone(),
        mode: config.kernel.mode,
        commit_sha: config.kernel.commit_sha.clone(),
    })
}

fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let salt: u16 = rand::random();
    format!("run-{stamp}-{salt:04x}")
}
