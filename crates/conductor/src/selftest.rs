//! Layered health check: KERNEL, GOVERNANCE, OPTIONAL.
//!
//! Each check runs against a scratch ledger under the system temp dir and
//! proves one load-bearing behavior end to end. KERNEL failures mean the
//! kernel cannot be trusted; GOVERNANCE failures mean runs would not be
//! governed; OPTIONAL failures degrade but do not fail the exit code.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, StubBackend};
use crate::budget::{CostMeter, Deadline};
use crate::cancel::CancelToken;
use crate::context::PromptPack;
use crate::gate::{GatePolicy, GateViolation, PublishRequest, check as gate_check};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{
    CURRENT_RECEIPT_VERSION, Decision, EngineMode, Handoff, HandoffMeta, HandoffStatus, Receipt,
    StepSpec, StepStatus, StepTier, TokenUsage,
};

pub const LAYER_KERNEL: &str = "KERNEL";
pub const LAYER_GOVERNANCE: &str = "GOVERNANCE";
pub const LAYER_OPTIONAL: &str = "OPTIONAL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestCheck {
    pub layer: String,
    pub name: String,
    pub pass: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub checks: Vec<SelfTestCheck>,
    pub kernel_ok: bool,
    pub governance_ok: bool,
    pub optional_ok: bool,
}

impl SelfTestReport {
    /// CLI exit code: 0 success, 1 governance failure, 2 kernel failure.
    pub fn exit_code(&self) -> i32 {
        if !self.kernel_ok {
            2
        } else if !self.governance_ok {
            1
        } else {
            0
        }
    }
}

fn check(layer: &str, name: &str, result: Result<String, String>) -> SelfTestCheck {
    match result {
        Ok(detail) => SelfTestCheck {
            layer: layer.to_string(),
            name: name.to_string(),
            pass: true,
            detail,
        },
        Err(detail) => SelfTestCheck {
            layer: layer.to_string(),
            name: name.to_string(),
            pass: false,
            detail,
        },
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "conductor-selftest-{}-{}",
        std::process::id(),
        Utc::now().format("%Y%m%d%H%M%S%f")
    ))
}

fn sample_receipt(step_id: &str) -> Receipt {
    Receipt {
        schema_version: CURRENT_RECEIPT_VERSION.to_string(),
        run_id: "selftest".to_string(),
        flow_key: "probe".to_string(),
        step_id: step_id.to_string(),
        agent_key: "probe".to_string(),
        engine: "stub".to_string(),
        mode: EngineMode::Stub,
        started_at: Utc::now(),
        completed_at: Utc::now(),
        duration_ms: 0,
        status: StepStatus::Succeeded,
        tokens: TokenUsage::default(),
        cost_usd: 0.0,
        exit_code: None,
        commit_sha: "selftest".to_string(),
        evidence: vec![],
        ac_ids: vec![],
        budget_overflow: vec![],
        timeout_event: None,
    }
}

fn kernel_checks(scratch: &Path) -> Vec<SelfTestCheck> {
    let ledger = Ledger::new(scratch.join("ledger"));
    let mut checks = Vec::new();

    checks.push(check(LAYER_KERNEL, "ledger_atomic_commit", {
        match ledger.write_receipt(&sample_receipt("probe")) {
            Ok(()) => match ledger.write_receipt(&sample_receipt("probe")) {
                Err(LedgerError::AlreadyCommitted { .. }) => {
                    Ok("duplicate commit refused".to_string())
                }
                Ok(()) => Err("duplicate receipt was accepted".to_string()),
                Err(e) => Err(format!("unexpected error: {e}")),
            },
            Err(e) => Err(format!("first commit failed: {e}")),
        }
    }));

    checks.push(check(LAYER_KERNEL, "ledger_roundtrip", {
        match ledger.read_receipt("selftest", "probe", "probe", "probe") {
            Ok(Some(receipt)) if receipt.step_id == "probe" => {
                Ok("receipt read back intact".to_string())
            }
            Ok(_) => Err("committed receipt missing on read".to_string()),
            Err(e) => Err(format!("read failed: {e:#}")),
        }
    }));

    checks.push(check(LAYER_KERNEL, "checkpoint_scan", {
        match ledger.read_last_checkpoint("selftest", "probe") {
            Ok(Some(step)) if step == "probe" => Ok("checkpoint found".to_string()),
            Ok(other) => Err(format!("unexpected checkpoint: {other:?}")),
            Err(e) => Err(format!("scan failed: {e:#}")),
        }
    }));

    checks.push(check(LAYER_KERNEL, "clock_monotonic", {
        let parent = Deadline::within(std::time::Duration::from_secs(60));
        let child = parent.child(std::time::Duration::from_secs(3600));
        match (parent.remaining(), child.remaining()) {
            (Some(p), Some(c)) if c <= p => Ok("child deadline capped by parent".to_string()),
            other => Err(format!("deadline nesting broken: {other:?}")),
        }
    }));

    checks.push(check(LAYER_KERNEL, "routing_closure", {
        let all_parse = Decision::vocabulary().iter().all(|d| {
            let token = format!("{d:?}").to_uppercase();
            // Debug form matches the wire form except InjectFlow.
            let token = if token == "INJECTFLOW" {
                "INJECT_FLOW".to_string()
            } else {
                token
            };
            Decision::parse(&token) == Some(*d)
        });
        if all_parse && Decision::parse("SOMETHING_ELSE").is_none() {
            Ok("vocabulary closed".to_string())
        } else {
            Err("vocabulary parse mismatch".to_string())
        }
    }));

    checks
}

fn governance_checks(scratch: &Path) -> Vec<SelfTestCheck> {
    let mut checks = Vec::new();
    let _ = scratch;

    checks.push(check(LAYER_GOVERNANCE, "redaction", {
        let leaked = "token=sk-ant-REDACTED";
        let clean = conductor_redact::redact(leaked);
        if clean.contains("sk-ant-") {
            Err("secret survived redaction".to_string())
        } else {
            Ok("secret patterns redacted".to_string())
        }
    }));

    checks.push(check(LAYER_GOVERNANCE, "gate_blocks_secret", {
        let handoff = Handoff::minimal(
            HandoffMeta {
                step_id: "publish".to_string(),
                agent_key: "probe".to_string(),
                flow_key: "gate".to_string(),
            },
            HandoffStatus::Verified,
            "probe",
        );
        let request = PublishRequest {
            diff: "+ key = \"sk-ant-REDACTED\"",
            handoff: &handoff,
            commit_sha: "selftest",
            force_push: false,
            target_ref: "refs/heads/main",
        };
        match gate_check(&request, &GatePolicy::default()) {
            Err(GateViolation::SecretDetected { .. }) => Ok("gate blocked secret".to_string()),
            Err(other) => Err(format!("wrong violation: {other}")),
            Ok(()) => Err("gate passed a secret-bearing diff".to_string()),
        }
    }));

    checks.push(check(LAYER_GOVERNANCE, "budget_refusal", {
        let mut meter = CostMeter::new(1.0);
        let first = meter.try_charge(0.9, &TokenUsage::default());
        let second = meter.try_charge(0.5, &TokenUsage::default());
        if first.is_ok() && second.is_err() && (meter.cumulative_usd() - 0.9).abs() < 1e-9 {
            Ok("cap enforced without mutation".to_string())
        } else {
            Err("budget cap not enforced".to_string())
        }
    }));

    checks
}

fn optional_checks(scratch: &Path) -> Vec<SelfTestCheck> {
    let mut checks = Vec::new();

    checks.push(check(LAYER_OPTIONAL, "stub_backend", {
        let backend = StubBackend::new();
        let step = StepSpec {
            step_id: "probe".to_string(),
            agent_key: "probe".to_string(),
            tier: StepTier::Optional,
            timeout_override_ms: None,
            depends_on: vec![],
            microloop: None,
            writes: vec![],
            skill: None,
            ac_ids: vec![],
        };
        let pack = PromptPack {
            role: "probe".to_string(),
            sections: vec![],
            output_token_budget: 100,
            schema_instruction: None,
        };
        match backend.execute(
            &step,
            "probe",
            &pack,
            scratch,
            &Deadline::unbounded(),
            &CancelToken::new(),
        ) {
            Ok(result) if result.structured_output.is_some() => {
                Ok("stub backend reachable".to_string())
            }
            Ok(_) => Err("stub returned no structured output".to_string()),
            Err(e) => Err(format!("stub failed: {}", e.message)),
        }
    }));

    checks.push(check(LAYER_OPTIONAL, "git_on_path", {
        match conductor_process::resolve_program("git") {
            Ok(path) => Ok(format!("git at {}", path.display())),
            Err(e) => Err(format!("{e:#}")),
        }
    }));

    checks
}

/// Run the full layered selftest.
pub fn run_selftest() -> SelfTestReport {
    let scratch = scratch_dir();
    let _ = std::fs::create_dir_all(&scratch);

    let mut checks = kernel_checks(&scratch);
    checks.extend(governance_checks(&scratch));
    checks.extend(optional_checks(&scratch));

    let _ = std::fs::remove_dir_all(&scratch);

    let layer_ok = |layer: &str| {
        checks
            .iter()
            .filter(|c| c.layer == layer)
            .all(|c| c.pass)
    };

    SelfTestReport {
        kernel_ok: layer_ok(LAYER_KERNEL),
        governance_ok: layer_ok(LAYER_GOVERNANCE),
        optional_ok: layer_ok(LAYER_OPTIONAL),
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selftest_kernel_and_governance_pass() {
        let report = run_selftest();
        for check in &report.checks {
            if check.layer != LAYER_OPTIONAL {
                assert!(check.pass, "{}/{}: {}", check.layer, check.name, check.detail);
            }
        }
        assert!(report.kernel_ok);
        assert!(report.governance_ok);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn exit_code_ranks_kernel_over_governance() {
        let mut report = run_selftest();
        report.governance_ok = false;
        assert_eq!(report.exit_code(), 1);
        report.kernel_ok = false;
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = run_selftest();
        let json = serde_json::to_string_pretty(&report).expect("serialize");
        assert!(json.contains("KERNEL"));
        assert!(json.contains("kernel_ok"));
    }
}
