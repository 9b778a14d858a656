//! The boundary gate: pre-publish checks before any external mutation.
//!
//! Three checks, all fatal on violation: secret scan over the proposed
//! diff, evidence freshness against the current commit, and the force-push
//! policy. A violation halts the run into `escalated` with a forensics
//! snapshot; there are no retries through this gate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::Classified;
use crate::types::Handoff;

/// Force-push scope policy. Pushes outside these ref prefixes must never be
/// forced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Ref prefixes considered sandbox scope (e.g. `refs/heads/sandbox/`).
    #[serde(default)]
    pub sandbox_ref_prefixes: Vec<String>,
}

impl GatePolicy {
    pub fn in_sandbox(&self, target_ref: &str) -> bool {
        self.sandbox_ref_prefixes
            .iter()
            .any(|p| target_ref.starts_with(p.as_str()))
    }
}

/// A proposed external mutation.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    /// The full diff text to be published.
    pub diff: &'a str,
    /// The handoff whose claims justify the publish.
    pub handoff: &'a Handoff,
    /// The commit the evidence must be bound to.
    pub commit_sha: &'a str,
    /// Whether the push would be forced.
    pub force_push: bool,
    /// Target ref of the mutation.
    pub target_ref: &'a str,
}

/// A fatal boundary violation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateViolation {
    #[error("secret detected in diff ({kind}, {count} match(es))")]
    SecretDetected { kind: String, count: usize },

    #[error("stale evidence for claim {claim}: bound to {bound}, current commit is {current}")]
    StaleEvidence {
        claim: String,
        bound: String,
        current: String,
    },

    #[error("evidence for claim {claim} is not bound to any commit")]
    UnboundEvidence { claim: String },

    #[error("force-push forbidden outside sandbox scope: {target_ref}")]
    ForcePushForbidden { target_ref: String },
}

impl GateViolation {
    /// The fatal classification that halts the run.
    pub fn to_classified(&self) -> Classified {
        Classified::fatal(format!("boundary violation: {self}"))
    }
}

/// Run all gate checks against a publish request.
pub fn check(request: &PublishRequest<'_>, policy: &GatePolicy) -> Result<(), GateViolation> {
    // 1. Secret scan with the closed pattern set.
    let matches = conductor_redact::scan(request.diff);
    if !matches.is_empty() {
        let kind = format!("{:?}", matches[0].kind);
        return Err(GateViolation::SecretDetected {
            kind,
            count: matches.len(),
        });
    }

    // 2. Every evidence claim must be bound to the current commit.
    for (claim, binding) in &request.handoff.summary.evidence {
        match binding.rsplit_once('@') {
            Some((_path, sha)) => {
                if sha != request.commit_sha {
                    return Err(GateViolation::StaleEvidence {
                        claim: claim.clone(),
                        bound: sha.to_string(),
                        current: request.commit_sha.to_string(),
                    });
                }
            }
            None => {
                return Err(GateViolation::UnboundEvidence {
                    claim: claim.clone(),
                });
            }
        }
    }

    // 3. Force-push policy.
    if request.force_push && !policy.in_sandbox(request.target_ref) {
        return Err(GateViolation::ForcePushForbidden {
            target_ref: request.target_ref.to_string(),
        });
    }

    Ok(())
}
