use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current receipt schema version
pub const CURRENT_RECEIPT_VERSION: &str = "conductor.receipt.v2";

/// Minimum supported receipt schema version
pub const MINIMUM_SUPPORTED_RECEIPT_VERSION: &str = "conductor.receipt.v1";

/// Current handoff schema version
pub const CURRENT_HANDOFF_VERSION: &str = "conductor.handoff.v1";

/// Current run meta schema version
pub const CURRENT_META_VERSION: &str = "conductor.meta.v1";

/// Top-level status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Escalated,
    Completed,
    Aborted,
}

impl RunStatus {
    /// Whether no further kernel work will happen for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

/// Status of one flow instance within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Escalated,
    Failed,
}

/// Physics status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Interrupted,
    Timeout,
}

/// Handoff verdict vocabulary. `Blocked` is reserved for literal missing
/// inputs, environment failure, boundary violations, or a non-derivable
/// human decision; ambiguity is an assumption plus `Unverified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffStatus {
    Verified,
    Unverified,
    Blocked,
}

/// The closed routing vocabulary. Anything a navigator produces outside
/// this set maps to `Escalate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Continue,
    Loop,
    Detour,
    InjectFlow,
    Escalate,
    Terminate,
}

impl Decision {
    /// Parse a bare decision token. Unknown input yields `None`; the caller
    /// escalates, never guesses.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "CONTINUE" => Some(Decision::Continue),
            "LOOP" => Some(Decision::Loop),
            "DETOUR" => Some(Decision::Detour),
            "INJECT_FLOW" => Some(Decision::InjectFlow),
            "ESCALATE" => Some(Decision::Escalate),
            "TERMINATE" => Some(Decision::Terminate),
            _ => None,
        }
    }

    /// All members of the vocabulary, for closure checks.
    pub fn vocabulary() -> &'static [Decision] {
        &[
            Decision::Continue,
            Decision::Loop,
            Decision::Detour,
            Decision::InjectFlow,
            Decision::Escalate,
            Decision::Terminate,
        ]
    }
}

/// Where a routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    FastPath,
    Navigator,
    Policy,
}

/// Importance tier of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTier {
    #[default]
    Kernel,
    Governance,
    Optional,
}

/// Which backend engine drives agent steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Deterministic scripted backend, zero cost. Used by selftest and tests.
    #[default]
    Stub,
    /// Spawn a configured agent command per step.
    Cli,
    /// POST step packs to an agent service over HTTP.
    Sdk,
}

impl EngineMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stub" => Some(EngineMode::Stub),
            "cli" => Some(EngineMode::Cli),
            "sdk" => Some(EngineMode::Sdk),
            _ => None,
        }
    }
}

/// Token accounting for one step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// The immutable physics record of one step execution.
///
/// Committed exactly once per `(run, flow, step)`; an interrupted step may
/// commit with `status = interrupted` and partial evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub schema_version: String,
    pub run_id: String,
    pub flow_key: String,
    pub step_id: String,
    pub agent_key: String,
    /// Engine identifier reported by the backend (e.g. `stub`, `cli`).
    pub engine: String,
    pub mode: EngineMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: StepStatus,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Commit the evidence was captured against.
    pub commit_sha: String,
    /// Paths to captured outputs, relative to the run root.
    #[serde(default)]
    pub evidence: Vec<PathBuf>,
    /// Acceptance-criteria IDs this step covers.
    #[serde(default)]
    pub ac_ids: Vec<String>,
    /// Context items dropped or truncated by the packer, in drop order.
    #[serde(default)]
    pub budget_overflow: Vec<String>,
    /// Set when the step was cut short by a deadline; names the scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_event: Option<String>,
}

/// One concern raised by a critic or gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concern {
    /// `blocker`, `major`, or `minor`.
    pub severity: String,
    pub description: String,
    /// `file:line` where applicable.
    pub location: String,
    pub recommendation: String,
}

/// Routing hint carried in a handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingHint {
    pub recommendation: String,
    pub can_further_iteration_help: bool,
    pub reason: String,
}

impl Default for RoutingHint {
    fn default() -> Self {
        Self {
            recommendation: "CONTINUE".to_string(),
            can_further_iteration_help: false,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffMeta {
    pub step_id: String,
    pub agent_key: String,
    pub flow_key: String,
}

/// What the step did and found, in structured form. Evidence values are
/// ledger-relative paths bound to a commit (`path@sha`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffSummary {
    pub what_i_did: String,
    pub what_i_found: String,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub evidence: BTreeMap<String, String>,
}

/// Structured output of a step for downstream consumption. Never contains
/// raw transcripts; those live in their own files referenced by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub schema_version: String,
    pub meta: HandoffMeta,
    pub status: HandoffStatus,
    pub summary: HandoffSummary,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    pub routing: RoutingHint,
}

impl Handoff {
    /// Minimal envelope for a step with nothing noteworthy to report.
    pub fn minimal(meta: HandoffMeta, status: HandoffStatus, what_i_did: &str) -> Self {
        Self {
            schema_version: CURRENT_HANDOFF_VERSION.to_string(),
            meta,
            status,
            summary: HandoffSummary {
                what_i_did: what_i_did.to_string(),
                ..HandoffSummary::default()
            },
            concerns: Vec::new(),
            assumptions: Vec::new(),
            routing: RoutingHint::default(),
        }
    }
}

/// One persisted routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub from_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_step: Option<String>,
    pub decision: Decision,
    pub source: DecisionSource,
    pub reason: String,
    /// Hash of the forensic pack the decision was made from.
    pub inputs_hash: String,
    pub at: DateTime<Utc>,
}

/// One scent-trail entry. Read-only to downstream steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScentEntry {
    pub step: String,
    pub decision: Decision,
    pub rationale: String,
    /// 0.0 to 1.0; fast-path decisions are 1.0.
    pub confidence: f64,
    pub at: DateTime<Utc>,
}

/// A non-fatal, non-kernel failure with a remediation hint. Feeds
/// dashboards, never routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Degradation {
    pub at: DateTime<Utc>,
    pub step: String,
    pub category: String,
    pub message: String,
    pub remediation: String,
}

/// The input request that created a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Flow keys in execution order.
    pub flows: Vec<String>,
    #[serde(default)]
    pub mode: EngineMode,
    /// Run-level cost cap in USD.
    pub budget_usd: f64,
    /// Free-form description of the input signal.
    #[serde(default)]
    pub signal: String,
}

/// Host fingerprint captured at run start for forensics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub kernel_version: String,
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

impl EnvironmentFingerprint {
    pub fn collect() -> Self {
        Self {
            kernel_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
        }
    }
}

/// Per-run metadata, rewritten atomically as status and cost evolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: String,
    pub run_id: String,
    pub spec: RunSpec,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cumulative_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Set once an escalation or abort notification has gone out.
    #[serde(default)]
    pub notified: bool,
    pub environment: EnvironmentFingerprint,
}

/// A significant kernel event, one line in `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: KernelEventKind,
}

impl KernelEvent {
    pub fn now(kind: KernelEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEventKind {
    StepStart {
        flow: String,
        step: String,
    },
    StepFinalized {
        flow: String,
        step: String,
        status: StepStatus,
    },
    RouteDecision {
        flow: String,
        step: String,
        decision: Decision,
    },
    Pause,
    Resume,
    Abort {
        reason: String,
    },
    TimeoutEvent {
        flow: String,
        step: String,
        scope: String,
    },
    Escalated {
        key: String,
        reason: String,
    },
}

/// One line in a step's execution log (`<flow>/logs/<step>.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepLogEntry {
    Attempt {
        attempt: u32,
        at: DateTime<Utc>,
    },
    Retry {
        category: String,
        retry_count: u32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    LoopIteration {
        iter: u32,
        critic_status: HandoffStatus,
        at: DateTime<Utc>,
    },
    DetourRun {
        signature: String,
        target: String,
        exit_code: i32,
        at: DateTime<Utc>,
    },
    BreakerFastFail {
        target: String,
        at: DateTime<Utc>,
    },
}

/// Declaration of one step in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    pub agent_key: String,
    #[serde(default)]
    pub tier: StepTier,
    /// Overrides the kernel's step timeout when set (milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override_ms: Option<u64>,
    /// Earlier step IDs this step waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microloop: Option<MicroloopSpec>,
    /// Artifacts this step writes; branches sharing none may run in
    /// parallel.
    #[serde(default)]
    pub writes: Vec<String>,
    /// When set, the step runs this deterministic skill instead of an agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default)]
    pub ac_ids: Vec<String>,
}

/// Author/critic pairing declared on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroloopSpec {
    /// Agent key of the critic partner.
    pub partner_agent_key: String,
    /// Iteration ceiling. Default 3; code loops use 5.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
}

fn default_max_iter() -> u32 {
    3
}

/// A named, versioned subgraph of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub flow_key: String,
    pub goal: String,
    #[serde(default)]
    pub exit_criteria: Vec<String>,
    #[serde(default)]
    pub non_goals: Vec<String>,
    pub steps: Vec<StepSpec>,
}

impl FlowSpec {
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// An operator-facing escalation. Resolved by injecting a vocabulary
/// decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub key: String,
    pub flow_key: String,
    pub step_id: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<EscalationResolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationResolution {
    pub decision: Decision,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub note: String,
}

/// Result reported by a backend for one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    /// Where the backend wrote its primary text output, if it produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text_path: Option<PathBuf>,
    /// Structured handoff payload, when the backend supports it natively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
}

impl StepResult {
    /// A zero-cost success with no artifacts, the stub backend's default.
    pub fn succeeded() -> Self {
        Self {
            status: StepStatus::Succeeded,
            output_text_path: None,
            structured_output: None,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            exit_code: None,
            raw_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parse_covers_vocabulary_and_rejects_noise() {
        for d in Decision::vocabulary() {
            let token = serde_json::to_string(d).expect("serialize");
            let token = token.trim_matches('"');
            assert_eq!(Decision::parse(token), Some(*d));
        }
        assert_eq!(Decision::parse("continue"), Some(Decision::Continue));
        assert_eq!(Decision::parse(" LOOP "), Some(Decision::Loop));
        assert_eq!(Decision::parse("RETRY"), None);
        assert_eq!(Decision::parse(""), None);
    }

    #[test]
    fn handoff_status_uses_screaming_wire_form() {
        let s = serde_json::to_string(&HandoffStatus::Verified).expect("serialize");
        assert_eq!(s, "\"VERIFIED\"");
        let back: HandoffStatus = serde_json::from_str("\"BLOCKED\"").expect("parse");
        assert_eq!(back, HandoffStatus::Blocked);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::new(100, 20);
        assert_eq!(usage.total, 120);
        usage.add(&TokenUsage::new(10, 5));
        assert_eq!(usage.prompt, 110);
        assert_eq!(usage.total, 135);
    }

    #[test]
    fn receipt_roundtrips_through_json() {
        let receipt = Receipt {
            schema_version: CURRENT_RECEIPT_VERSION.to_string(),
            run_id: "run-1".to_string(),
            flow_key: "build".to_string(),
            step_id: "implement".to_string(),
            agent_key: "implementer".to_string(),
            engine: "stub".to_string(),
            mode: EngineMode::Stub,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 12,
            status: StepStatus::Succeeded,
            tokens: TokenUsage::new(10, 2),
            cost_usd: 0.0,
            exit_code: None,
            commit_sha: "deadbeef".to_string(),
            evidence: vec![PathBuf::from("build/logs/implement.jsonl")],
            ac_ids: vec!["AC-1".to_string()],
            budget_overflow: vec![],
            timeout_event: None,
        };

        let json = serde_json::to_string(&receipt).expect("serialize");
        let back: Receipt = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.step_id, "implement");
        assert_eq!(back.status, StepStatus::Succeeded);
        assert_eq!(back.tokens.total, 12);
    }

    #[test]
    fn kernel_event_kind_is_tagged_by_event_field() {
        let event = KernelEvent::now(KernelEventKind::StepStart {
            flow: "build".to_string(),
            step: "implement".to_string(),
        });
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "step_start");
        assert_eq!(json["flow"], "build");
    }

    #[test]
    fn engine_mode_parses_cli_surface_values() {
        assert_eq!(EngineMode::parse("stub"), Some(EngineMode::Stub));
        assert_eq!(EngineMode::parse("CLI"), Some(EngineMode::Cli));
        assert_eq!(EngineMode::parse("sdk"), Some(EngineMode::Sdk));
        assert_eq!(EngineMode::parse("cloud"), None);
    }

    #[test]
    fn minimal_handoff_defaults_to_no_further_iteration() {
        let handoff = Handoff::minimal(
            HandoffMeta {
                step_id: "s".to_string(),
                agent_key: "a".to_string(),
                flow_key: "f".to_string(),
            },
            HandoffStatus::Verified,
            "ran the step",
        );
        assert!(!handoff.routing.can_further_iteration_help);
        assert!(handoff.concerns.is_empty());
    }
}
