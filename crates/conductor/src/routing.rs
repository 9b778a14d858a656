//! The routing engine: one decision from a closed vocabulary per call.
//!
//! Deterministic fast-paths are evaluated first against the handoff and
//! receipt. Only when none matches does the bounded navigator get a small
//! forensic pack (counts and statuses, never prose) and thirty seconds to
//! answer with one vocabulary token. Anything else maps to `ESCALATE`; the
//! engine never guesses.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classify::SignatureTracker;
use crate::types::{
    Decision, DecisionSource, Handoff, HandoffStatus, RoutingRecord, ScentEntry, StepStatus,
};

/// Deadline for one navigator advisory call.
pub const NAVIGATOR_DEADLINE: Duration = Duration::from_secs(30);

/// Attempts allowed per detour per step before escalating.
pub const DETOUR_ATTEMPT_LIMIT: u32 = 2;

/// The bounded, prose-free input for a navigator call. Also the hash basis
/// for `inputs_hash` on the persisted decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForensicPack {
    pub step_id: String,
    pub agent_key: String,
    pub receipt_status: Option<StepStatus>,
    pub handoff_status: Option<HandoffStatus>,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub lint_count: u32,
    pub diff_files: u32,
    pub diff_insertions: u32,
    pub diff_deletions: u32,
    pub iteration: u32,
    pub signatures: Vec<String>,
}

/// Hash of the forensic pack, recorded on every routing decision.
pub fn inputs_hash(pack: &ForensicPack) -> String {
    let canonical = serde_json::to_string(pack).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Advisor consulted when no fast-path matches. The prompt contract is
/// outside the kernel; the kernel only clamps the answer to the vocabulary.
pub trait Navigator: Send + Sync {
    fn advise(&self, pack: &ForensicPack) -> Result<String>;
}

/// Navigator returning a fixed answer. Used by tests and the stub mode.
#[derive(Debug, Clone)]
pub struct StaticNavigator {
    pub answer: String,
}

impl Navigator for StaticNavigator {
    fn advise(&self, _pack: &ForensicPack) -> Result<String> {
        Ok(self.answer.clone())
    }
}

/// Navigator that POSTs the forensic pack to a cheap model endpoint.
///
/// Deterministic settings where supported (temperature zero); a response
/// outside the vocabulary still maps to `ESCALATE` downstream.
pub struct HttpNavigator {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
}

impl HttpNavigator {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(NAVIGATOR_DEADLINE)
            .build()
            .context("failed to build navigator client")?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
        })
    }
}

impl Navigator for HttpNavigator {
    fn advise(&self, pack: &ForensicPack) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "forensics": pack,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .context("navigator request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("navigator returned http {}", status.as_u16());
        }
        let value: serde_json::Value = response.json().context("navigator response not JSON")?;
        let token = value
            .get("decision")
            .and_then(|d| d.as_str())
            .context("navigator response missing decision field")?;
        Ok(token.to_string())
    }
}

/// One detour catalog rule: a failure signature mapped to a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetourRule {
    pub signature: String,
    pub target_skill: String,
}

/// The detour catalog with its per-step attempt limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetourCatalog {
    pub rules: Vec<DetourRule>,
}

impl DetourCatalog {
    pub fn lookup(&self, signature: &str) -> Option<&DetourRule> {
        self.rules.iter().find(|r| r.signature == signature)
    }
}

/// Everything routing consults for one decision. Receipts and declared
/// intent only; agent prose is never an input.
#[derive(Debug)]
pub struct RoutingInput<'a> {
    pub flow_key: &'a str,
    pub step_id: &'a str,
    pub handoff: Option<&'a Handoff>,
    pub receipt_status: StepStatus,
    /// Whether the step sits inside a micro-loop right now.
    pub in_microloop: bool,
    pub iteration: u32,
    pub max_iter: u32,
    /// Per-step failure signature counts.
    pub signatures: &'a SignatureTracker,
    /// Signature of the most recent failure, if any.
    pub last_signature: Option<&'a str>,
    /// Detour attempts already spent on this step, per target skill.
    pub detour_attempts: u32,
    /// Explicit rebase-needed marker from the workspace state.
    pub rebase_needed: bool,
    pub forensics: ForensicPack,
}

/// The routed result, ready to persist.
#[derive(Debug, Clone)]
pub struct Routed {
    pub decision: Decision,
    pub source: DecisionSource,
    pub reason: String,
    /// Detour skill or injected flow, when the decision names a target.
    pub target: Option<String>,
    pub inputs_hash: String,
    pub confidence: f64,
}

impl Routed {
    pub fn record(&self, from_step: &str) -> RoutingRecord {
        RoutingRecord {
            from_step: from_step.to_string(),
            to_step: self.target.clone(),
            decision: self.decision,
            source: self.source,
            reason: self.reason.clone(),
            inputs_hash: self.inputs_hash.clone(),
            at: Utc::now(),
        }
    }

    pub fn scent(&self, step: &str) -> ScentEntry {
        ScentEntry {
            step: step.to_string(),
            decision: self.decision,
            rationale: self.reason.clone(),
            confidence: self.confidence,
            at: Utc::now(),
        }
    }
}

fn routed(
    input: &RoutingInput<'_>,
    decision: Decision,
    source: DecisionSource,
    reason: impl Into<String>,
    target: Option<String>,
    confidence: f64,
) -> Routed {
    Routed {
        decision,
        source,
        reason: reason.into(),
        target,
        inputs_hash: inputs_hash(&input.forensics),
        confidence,
    }
}

/// Deterministic fast-path evaluation. Returns `None` when no rule fires.
pub fn fast_path(input: &RoutingInput<'_>, catalog: &DetourCatalog) -> Option<Routed> {
    // Blocked handoffs are literal: missing inputs, environment failure, or
    // a decision only a human can make.
    if let Some(handoff) = input.handoff {
        if handoff.status == HandoffStatus::Blocked {
            return Some(routed(
                input,
                Decision::Escalate,
                DecisionSource::FastPath,
                "blocked_handoff",
                None,
                1.0,
            ));
        }
    }

    if let Some(handoff) = input.handoff {
        if handoff.status == HandoffStatus::Verified {
            return Some(routed(
                input,
                Decision::Continue,
                DecisionSource::FastPath,
                "verified",
                None,
                1.0,
            ));
        }
    }

    if input.in_microloop
        && input.iteration < input.max_iter
        && input
            .handoff
            .is_some_and(|h| h.routing.can_further_iteration_help)
    {
        return Some(routed(
            input,
            Decision::Loop,
            DecisionSource::FastPath,
            "iteration_can_help",
            None,
            1.0,
        ));
    }

    // A failure signature seen twice routes to its cataloged remediation.
    if let Some(signature) = input.last_signature {
        let repeats = input.signatures.count(signature);
        let rule = catalog.lookup(signature);
        if let Some(rule) = rule {
            if input.detour_attempts >= DETOUR_ATTEMPT_LIMIT {
                return Some(routed(
                    input,
                    Decision::Escalate,
                    DecisionSource::FastPath,
                    "detour_attempts_exhausted",
                    None,
                    1.0,
                ));
            }
            if repeats >= 2 {
                return Some(routed(
                    input,
                    Decision::Detour,
                    DecisionSource::FastPath,
                    format!("repeated_signature:{signature}"),
                    Some(rule.target_skill.clone()),
                    1.0,
                ));
            }
            // Recognized detour signature on first sight.
            return Some(routed(
                input,
                Decision::Detour,
                DecisionSource::FastPath,
                format!("cataloged_signature:{signature}"),
                Some(rule.target_skill.clone()),
                1.0,
            ));
        }
    }

    if input.rebase_needed {
        return Some(routed(
            input,
            Decision::InjectFlow,
            DecisionSource::FastPath,
            "rebase_needed",
            Some("reset".to_string()),
            1.0,
        ));
    }

    None
}

/// Route one step outcome: fast-path first, then the navigator, then
/// escalate on doubt.
pub fn decide(
    input: &RoutingInput<'_>,
    catalog: &DetourCatalog,
    navigator: &dyn Navigator,
) -> Routed {
    if let Some(fast) = fast_path(input, catalog) {
        return fast;
    }

    match navigator.advise(&input.forensics) {
        Ok(token) => match Decision::parse(&token) {
            Some(decision) => routed(
                input,
                decision,
                DecisionSource::Navigator,
                format!("navigator:{}", token.trim()),
                None,
                0.5,
            ),
            None => routed(
                input,
                Decision::Escalate,
                DecisionSource::Navigator,
                format!("navigator_out_of_vocabulary:{}", token.trim()),
                None,
                1.0,
            ),
        },
        Err(e) => routed(
            input,
            Decision::Escalate,
            DecisionSource::Navigator,
            format!("navigator_error:{e:#}"),
            None,
            1.0,
        ),
    }
}


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;

    // Routing closure: whatever the navigator says, the emitted decision is
    // a member of the closed vocabulary.
    proptest! {
        #[test]
        fn every_navigator_answer_maps_into_vocabulary(answer in ".{0,40}") {
            let sigs = SignatureTracker::new();
            let input = RoutingInput {
                flow_key: "build",
                step_id: "implement",
                handoff: None,
                receipt_status: StepStatus::Failed,
                in_microloop: false,
                iteration: 0,
                max_iter: 3,
                signatures: &sigs,
                last_signature: None,
                detour_attempts: 0,
                rebase_needed: false,
                forensics: ForensicPack::default(),
            };
            let navigator = StaticNavigator { answer };
            let verdict = decide(&input, &DetourCatalog::default(), &navigator);
            prop_assert!(Decision::vocabulary().contains(&verdict.decision));
        }
    }
}
