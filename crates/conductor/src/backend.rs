//! Backend adapters: the capability contract between the kernel and
//! whatever executes one agent step.
//!
//! Each backend advertises a capability set; the kernel subsumes whatever
//! is missing. A backend without `structured_output` gets a schema prompt
//! from the context packer and its reply is mined for a fenced JSON block
//! here. The scheduler itself has no backend-conditional code; it sees one
//! `Backend` trait and one `StepResult` shape.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_process::{CommandSpec, run_captured};

use crate::budget::Deadline;
use crate::cancel::CancelToken;
use crate::classify::RawFailure;
use crate::context::{PromptPack, estimate_tokens};
use crate::types::{StepResult, StepSpec, StepStatus};

/// Capabilities a backend may advertise. The kernel bridges whatever is
/// absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    StructuredOutput,
    Hooks,
    Streaming,
    HotContext,
}

/// A backend's identity and advertised capability set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub engine: String,
    pub capabilities: BTreeSet<Capability>,
}

impl BackendDescriptor {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Executes one agent step given a prompt pack. Must observe the deadline
/// and the cancel token; both are checked before and during the call.
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> BackendDescriptor;

    /// Run one step. `workdir` is the flow's transcript directory; any
    /// output files the backend produces belong under it.
    fn execute(
        &self,
        step: &StepSpec,
        agent_key: &str,
        pack: &PromptPack,
        workdir: &Path,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<StepResult, RawFailure>;
}

/// Extract the first fenced JSON block from backend text output.
///
/// Subsumption path for backends without native structured output.
pub fn extract_fenced_json(text: &str) -> Option<serde_json::Value> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find("```") {
        let fence_start = search_from + rel;
        let body_start = match text[fence_start..].find('\n') {
            Some(nl) => fence_start + nl + 1,
            None => return None,
        };
        let info = text[fence_start + 3..body_start].trim();
        let Some(rel_end) = text[body_start..].find("```") else {
            return None;
        };
        let body = &text[body_start..body_start + rel_end];
        search_from = body_start + rel_end + 3;

        if !info.is_empty() && info != "json" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body.trim()) {
            return Some(value);
        }
    }
    None
}

// ---- stub backend ---------------------------------------------------------

/// One scripted outcome for the stub backend.
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Succeed with a structured handoff payload.
    Succeed {
        handoff: serde_json::Value,
        cost_usd: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// Fail with this raw failure.
    Fail(RawFailure),
}

impl StubOutcome {
    /// A verified, zero-cost success — the stub's default behavior.
    pub fn verified() -> Self {
        Self::with_status("VERIFIED", false)
    }

    pub fn with_status(status: &str, can_further_iteration_help: bool) -> Self {
        StubOutcome::Succeed {
            handoff: serde_json::json!({
                "status": status,
                "summary": {
                    "what_i_did": "stub execution",
                    "what_i_found": "",
                    "key_decisions": [],
                    "evidence": {},
                },
                "concerns": [],
                "assumptions": [],
                "routing": {
                    "recommendation": "CONTINUE",
                    "can_further_iteration_help": can_further_iteration_help,
                    "reason": "",
                },
            }),
            cost_usd: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Deterministic scripted backend. Outcomes are keyed by
/// `(step_id, agent_key)` and consumed in order; unscripted executions
/// succeed verified at zero cost.
#[derive(Debug, Default)]
pub struct StubBackend {
    scripts: Mutex<BTreeMap<(String, String), VecDeque<StubOutcome>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next execution of `(step_id, agent_key)`.
    pub fn script(&self, step_id: &str, agent_key: &str, outcome: StubOutcome) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .entry((step_id.to_string(), agent_key.to_string()))
            .or_default()
            .push_back(outcome);
    }

    fn next_outcome(&self, step_id: &str, agent_key: &str) -> StubOutcome {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .get_mut(&(step_id.to_string(), agent_key.to_string()))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(StubOutcome::verified)
    }
}

impl Backend for StubBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            engine: "stub".to_string(),
            capabilities: BTreeSet::from([Capability::StructuredOutput]),
        }
    }

    fn execute(
        &self,
        step: &StepSpec,
        agent_key: &str,
        _pack: &PromptPack,
        _workdir: &Path,
        _deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<StepResult, RawFailure> {
        if cancel.is_cancelled() {
            return Err(RawFailure::message("step cancelled before execution"));
        }

        match self.next_outcome(&step.step_id, agent_key) {
            StubOutcome::Succeed {
                handoff,
                cost_usd,
                prompt_tokens,
                completion_tokens,
            } => Ok(StepResult {
                status: StepStatus::Succeeded,
                output_text_path: None,
                structured_output: Some(handoff),
                tokens: crate::types::TokenUsage::new(prompt_tokens, completion_tokens),
                cost_usd,
                exit_code: None,
                raw_error: None,
            }),
            StubOutcome::Fail(raw) => Err(raw),
        }
    }
}

// ---- cli backend ----------------------------------------------------------

/// Backend that spawns a configured agent command per step.
///
/// The prompt pack is written to a file; the command gets its path plus the
/// step identity in environment variables and replies on stdout.
pub struct CliBackend {
    command: CommandSpec,
}

impl CliBackend {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl Backend for CliBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            engine: "cli".to_string(),
            capabilities: BTreeSet::new(),
        }
    }

    fn execute(
        &self,
        step: &StepSpec,
        agent_key: &str,
        pack: &PromptPack,
        workdir: &Path,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<StepResult, RawFailure> {
        if cancel.is_cancelled() {
            return Err(RawFailure::message("step cancelled before execution"));
        }

        let rendered = pack.render();
        let prompt_path = workdir.join(format!("{}-{}-prompt.md", step.step_id, agent_key));
        if let Some(parent) = prompt_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RawFailure::message(format!("io error: {e}")))?;
        }
        std::fs::write(&prompt_path, &rendered)
            .map_err(|e| RawFailure::message(format!("io error: {e}")))?;

        let spec = self
            .command
            .clone()
            .with_env("CONDUCTOR_PROMPT_PATH", prompt_path.display().to_string())
            .with_env("CONDUCTOR_STEP_ID", step.step_id.clone())
            .with_env("CONDUCTOR_AGENT_KEY", agent_key.to_string());

        let out = run_captured(&spec, deadline.remaining())
            .map_err(|e| RawFailure::message(format!("{e:#}")))?;

        if out.timed_out {
            return Err(RawFailure::message(format!(
                "agent command timed out: {}",
                spec.display_line()
            )));
        }
        if out.exit_code != 0 {
            return Err(RawFailure {
                message: tail(&out.stderr, 20),
                exit_code: Some(out.exit_code),
                http_status: None,
                retry_after: None,
            });
        }

        let stdout = conductor_redact::redact(&out.stdout);
        let output_path = workdir.join(format!("{}-{}-output.txt", step.step_id, agent_key));
        std::fs::write(&output_path, &stdout)
            .map_err(|e| RawFailure::message(format!("io error: {e}")))?;

        Ok(StepResult {
            status: StepStatus::Succeeded,
            output_text_path: Some(output_path),
            structured_output: extract_fenced_json(&stdout),
            tokens: crate::types::TokenUsage::new(
                estimate_tokens(&rendered),
                estimate_tokens(&stdout),
            ),
            cost_usd: 0.0,
            exit_code: Some(out.exit_code),
            raw_error: None,
        })
    }
}

// ---- sdk backend ----------------------------------------------------------

/// Backend that POSTs step packs to an agent service.
pub struct SdkBackend {
    client: reqwest::blocking::Client,
    url: String,
    /// Environment variable holding the bearer token. Credentials are read
    /// from the environment only, never from ledger files.
    token_env: String,
}

/// Wire shape of an agent-service reply.
#[derive(Debug, Deserialize)]
struct SdkReply {
    status: String,
    #[serde(default)]
    handoff: Option<serde_json::Value>,
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cost_usd: f64,
}

impl SdkBackend {
    pub fn new(url: impl Into<String>, token_env: impl Into<String>) -> Result<Self, RawFailure> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| RawFailure::message(format!("failed to build sdk client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token_env: token_env.into(),
        })
    }
}

impl Backend for SdkBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            engine: "sdk".to_string(),
            capabilities: BTreeSet::from([Capability::StructuredOutput, Capability::Streaming]),
        }
    }

    fn execute(
        &self,
        step: &StepSpec,
        agent_key: &str,
        pack: &PromptPack,
        workdir: &Path,
        deadline: &Deadline,
        cancel: &CancelToken,
    ) -> Result<StepResult, RawFailure> {
        if cancel.is_cancelled() {
            return Err(RawFailure::message("step cancelled before execution"));
        }

        let token = std::env::var(&self.token_env).ok();

        let timeout = deadline
            .remaining()
            .unwrap_or(Duration::from_secs(120))
            .max(Duration::from_millis(1));

        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&serde_json::json!({
                "step_id": step.step_id,
                "agent_key": agent_key,
                "prompt": pack.render(),
                "output_token_budget": pack.output_token_budget,
            }));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            RawFailure::message(if e.is_timeout() {
                format!("sdk request timed out: {e}")
            } else {
                format!("sdk request failed to send: {e}")
            })
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(RawFailure {
                message: format!("sdk returned http {}", status.as_u16()),
                exit_code: None,
                http_status: Some(status.as_u16()),
                retry_after,
            });
        }

        let reply: SdkReply = response
            .json()
            .map_err(|e| RawFailure::message(format!("invalid sdk reply: {e}")))?;

        let output_text_path = match reply.output_text {
            Some(text) => {
                let redacted = conductor_redact::redact(&text);
                let path = workdir.join(format!("{}-{}-output.txt", step.step_id, agent_key));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RawFailure::message(format!("io error: {e}")))?;
                }
                std::fs::write(&path, redacted)
                    .map_err(|e| RawFailure::message(format!("io error: {e}")))?;
                Some(path)
            }
            None => None,
        };

        let step_status = match reply.status.as_str() {
            "succeeded" => StepStatus::Succeeded,
            "interrupted" => StepStatus::Interrupted,
            "timeout" => StepStatus::Timeout,
            _ => StepStatus::Failed,
        };
        if step_status == StepStatus::Failed {
            return Err(RawFailure::message(format!(
                "sdk reported step failure: {}",
                reply.status
            )));
        }

        Ok(StepResult {
            status: step_status,
            output_text_path,
            structured_output: reply.handoff,
            tokens: crate::types::TokenUsage::new(reply.prompt_tokens, reply.completion_tokens),
            cost_usd: reply.cost_usd,
            exit_code: None,
            raw_error: None,
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::types::StepTier;

    fn step(step_id: &str) -> StepSpec {
        StepSpec {
            step_id: step_id.to_string(),
            agent_key: "implementer".to_string(),
            tier: StepTier::Kernel,
            timeout_override_ms: None,
            depends_on: vec![],
            microloop: None,
            writes: vec![],
            skill: None,
            ac_ids: vec![],
        }
    }

    fn empty_pack() -> PromptPack {
        PromptPack {
            role: "implementer".to_string(),
            sections: vec![],
            output_token_budget: 1_000,
            schema_instruction: None,
        }
    }

    #[test]
    fn extract_fenced_json_finds_json_blocks() {
        let text = "prose\n```json\n{\"status\": \"VERIFIED\"}\n```\nmore prose";
        let value = extract_fenced_json(text).expect("found");
        assert_eq!(value["status"], "VERIFIED");
    }

    #[test]
    fn extract_fenced_json_skips_non_json_fences() {
        let text = "```rust\nfn main() {}\n```\n```\n{\"ok\": true}\n```";
        let value = extract_fenced_json(text).expect("found");
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn extract_fenced_json_handles_no_match() {
        assert!(extract_fenced_json("no fences at all").is_none());
        assert!(extract_fenced_json("```json\nnot json\n```").is_none());
        assert!(extract_fenced_json("``` unterminated").is_none());
    }

    #[test]
    fn stub_backend_defaults_to_verified_zero_cost() {
        let backend = StubBackend::new();
        let td = tempdir().expect("tempdir");
        let result = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &CancelToken::new(),
            )
            .expect("execute");
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.cost_usd, 0.0);
        let handoff = result.structured_output.expect("structured");
        assert_eq!(handoff["status"], "VERIFIED");
    }

    #[test]
    fn stub_backend_consumes_scripts_in_order() {
        let backend = StubBackend::new();
        backend.script(
            "implement",
            "implementer",
            StubOutcome::Fail(RawFailure::http(429, "too many requests")),
        );
        backend.script("implement", "implementer", StubOutcome::verified());

        let td = tempdir().expect("tempdir");
        let first = backend.execute(
            &step("implement"),
            "implementer",
            &empty_pack(),
            td.path(),
            &Deadline::unbounded(),
            &CancelToken::new(),
        );
        assert!(first.is_err());

        let second = backend.execute(
            &step("implement"),
            "implementer",
            &empty_pack(),
            td.path(),
            &Deadline::unbounded(),
            &CancelToken::new(),
        );
        assert!(second.is_ok());
    }

    #[test]
    fn stub_backend_rejects_cancelled_calls() {
        let backend = StubBackend::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let td = tempdir().expect("tempdir");
        let err = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &cancel,
            )
            .unwrap_err();
        assert!(err.message.contains("cancelled"));
    }

    #[cfg(unix)]
    #[test]
    fn cli_backend_extracts_structured_output_and_writes_artifacts() {
        let td = tempdir().expect("tempdir");
        let backend = CliBackend::new(CommandSpec::new(
            "sh",
            [
                "-c",
                "printf 'thinking...\\n```json\\n{\"status\": \"VERIFIED\"}\\n```\\n'",
            ],
        ));

        let result = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &CancelToken::new(),
            )
            .expect("execute");

        assert_eq!(result.status, StepStatus::Succeeded);
        let structured = result.structured_output.expect("subsumed json");
        assert_eq!(structured["status"], "VERIFIED");
        assert!(result.output_text_path.expect("output path").exists());
        assert!(td.path().join("implement-implementer-prompt.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn cli_backend_maps_nonzero_exit_to_failure() {
        let td = tempdir().expect("tempdir");
        let backend = CliBackend::new(CommandSpec::new(
            "sh",
            ["-c", "echo 'missing required input: diff' >&2; exit 2"],
        ));

        let err = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.exit_code, Some(2));
        assert!(err.message.contains("missing required input"));
    }

    #[test]
    fn sdk_backend_handles_rate_limit_with_retry_after() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("request");
            let response = tiny_http::Response::from_string("slow down")
                .with_status_code(tiny_http::StatusCode(429))
                .with_header(
                    tiny_http::Header::from_bytes("Retry-After", "2").expect("header"),
                );
            request.respond(response).expect("respond");
        });

        let backend = SdkBackend::new(url, "CONDUCTOR_TEST_TOKEN_UNSET").expect("backend");
        let td = tempdir().expect("tempdir");
        let err = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &CancelToken::new(),
            )
            .unwrap_err();

        assert_eq!(err.http_status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        handle.join().expect("join");
    }

    #[test]
    fn sdk_backend_parses_successful_reply() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("request");
            let body = serde_json::json!({
                "status": "succeeded",
                "handoff": {"status": "VERIFIED"},
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "cost_usd": 0.01,
            });
            let response = tiny_http::Response::from_string(body.to_string()).with_header(
                tiny_http::Header::from_bytes("Content-Type", "application/json")
                    .expect("header"),
            );
            request.respond(response).expect("respond");
        });

        let backend = SdkBackend::new(url, "CONDUCTOR_TEST_TOKEN_UNSET").expect("backend");
        let td = tempdir().expect("tempdir");
        let result = backend
            .execute(
                &step("implement"),
                "implementer",
                &empty_pack(),
                td.path(),
                &Deadline::unbounded(),
                &CancelToken::new(),
            )
            .expect("execute");

        assert_eq!(result.tokens.total, 120);
        assert!((result.cost_usd - 0.01).abs() < f64::EPSILON);
        assert_eq!(
            result.structured_output.expect("handoff")["status"],
            "VERIFIED"
        );
        handle.join().expect("join");
    }
}
