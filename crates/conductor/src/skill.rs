//! Skill execution: deterministic side-tools invoked by the kernel.
//!
//! A skill is an opaque command (test runner, linter, scanner). Its
//! captured output is redacted before anything links to it from a receipt.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use conductor_process::{CommandSpec, run_captured};

use crate::budget::Deadline;
use crate::classify::RawFailure;

/// One registered skill: the command plus an optional tool-timeout
/// override.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub spec: CommandSpec,
    pub timeout: Option<std::time::Duration>,
}

/// Named skills available to steps and detours.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, SkillEntry>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        spec: CommandSpec,
        timeout: Option<std::time::Duration>,
    ) {
        self.skills.insert(name.into(), SkillEntry { spec, timeout });
    }

    pub fn get(&self, name: &str) -> Option<&SkillEntry> {
        self.skills.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.keys().map(|k| k.as_str())
    }
}

/// Result of one skill execution. Output lives on disk, already redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillOutcome {
    pub skill: String,
    pub exit_code: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl SkillOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run one skill under the tool deadline, capturing redacted output under
/// `out_dir`.
pub fn run_skill(
    name: &str,
    spec: &CommandSpec,
    out_dir: &Path,
    step_id: &str,
    deadline: &Deadline,
) -> Result<SkillOutcome, RawFailure> {
    fs::create_dir_all(out_dir).map_err(|e| RawFailure::message(format!("io error: {e}")))?;

    let out = run_captured(spec, deadline.remaining())
        .map_err(|e| RawFailure::message(format!("{e:#}")))?;

    let stdout_path = out_dir.join(format!("{step_id}-{name}.stdout.log"));
    let stderr_path = out_dir.join(format!("{step_id}-{name}.stderr.log"));
    fs::write(&stdout_path, conductor_redact::redact(&out.stdout))
        .map_err(|e| RawFailure::message(format!("io error: {e}")))?;
    fs::write(&stderr_path, conductor_redact::redact(&out.stderr))
        .map_err(|e| RawFailure::message(format!("io error: {e}")))?;

    Ok(SkillOutcome {
        skill: name.to_string(),
        exit_code: out.exit_code,
        stdout_path,
        stderr_path,
        duration_ms: out.duration_ms,
        timed_out: out.timed_out,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[cfg(unix)]
    fn shell(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn registry_resolves_registered_skills() {
        let mut registry = SkillRegistry::new();
        registry.register(
            "auto-linter",
            CommandSpec::new("cargo", ["fmt"]),
            Some(Duration::from_secs(60)),
        );
        let entry = registry.get("auto-linter").expect("registered");
        assert_eq!(entry.timeout, Some(Duration::from_secs(60)));
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["auto-linter"]);
    }

    #[cfg(unix)]
    #[test]
    fn run_skill_captures_and_redacts_output() {
        let td = tempdir().expect("tempdir");
        let outcome = run_skill(
            "scanner",
            &shell("echo 'found token sk-ant-api03-abc123def456'; echo lint-err >&2"),
            td.path(),
            "scan",
            &Deadline::unbounded(),
        )
        .expect("run");

        assert!(outcome.success());
        let stdout = fs::read_to_string(&outcome.stdout_path).expect("read");
        assert!(!stdout.contains("sk-ant-"));
        assert!(stdout.contains(conductor_redact::REDACTED));
        let stderr = fs::read_to_string(&outcome.stderr_path).expect("read");
        assert!(stderr.contains("lint-err"));
    }

    #[cfg(unix)]
    #[test]
    fn run_skill_reports_nonzero_exit_without_error() {
        let td = tempdir().expect("tempdir");
        let outcome = run_skill(
            "tests",
            &shell("echo '1 test failed'; exit 1"),
            td.path(),
            "verify",
            &Deadline::unbounded(),
        )
        .expect("run");
        assert_eq!(outcome.exit_code, 1);
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[test]
    fn run_skill_times_out_under_tool_deadline() {
        let td = tempdir().expect("tempdir");
        let outcome = run_skill(
            "slow",
            &shell("sleep 30"),
            td.path(),
            "verify",
            &Deadline::within(Duration::from_millis(150)),
        )
        .expect("run");
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[test]
    fn run_skill_spawn_failure_is_a_raw_failure() {
        let td = tempdir().expect("tempdir");
        let err = run_skill(
            "ghost",
            &CommandSpec::new("conductor-no-such-binary", Vec::<String>::new()),
            td.path(),
            "verify",
            &Deadline::unbounded(),
        )
        .unwrap_err();
        assert!(err.message.contains("failed to spawn"));
    }
}
