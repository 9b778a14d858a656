//! Deadline-bounded process execution for the conductor kernel.
//!
//! Skills (test runners, linters, scanners) and the CLI backend both run
//! through [`run_captured`]: spawn, capture both pipes, enforce a deadline,
//! and report exit code plus wall-clock duration. A process that outlives
//! its deadline is killed and reported with `timed_out = true` rather than
//! an error, so the caller can classify the failure itself.
//!
//! # Example
//!
//! ```ignore
//! use conductor_process::{CommandSpec, run_captured};
//! use std::time::Duration;
//!
//! let spec = CommandSpec::new("cargo", ["--version"]);
//! let out = run_captured(&spec, Some(Duration::from_secs(5))).expect("run");
//! assert_eq!(out.exit_code, 0);
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Poll interval while waiting for a child under a deadline.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Exit code reported when the child was killed or produced none.
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// A command to execute, with optional working directory and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory (inherited when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Build a spec from a program and arguments.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The command line as one display string.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, or [`EXIT_CODE_UNAVAILABLE`] when killed.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded its deadline and was killed.
    pub timed_out: bool,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the command exited zero without timing out.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Resolve a program on `PATH`, reporting a clear error when absent.
///
/// Used by selftest to prove skill binaries exist before a run depends on
/// them.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    which::which(program).with_context(|| format!("program not found on PATH: {program}"))
}

/// Run a command to completion, capturing both pipes.
///
/// With a `deadline`, the child is polled and killed once the deadline
/// elapses; the captured output up to that point is returned with
/// `timed_out = true`.
pub fn run_captured(spec: &CommandSpec, deadline: Option<Duration>) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn: {}", spec.display_line()))?;

    // Drain both pipes on threads so a chatty child cannot block on a full
    // pipe buffer while we poll for exit.
    let stdout_thread = child.stdout.take().map(drain_pipe);
    let stderr_thread = child.stderr.take().map(drain_pipe);

    let timed_out = match deadline {
        Some(limit) => wait_with_deadline(&mut child, start, limit)?,
        None => {
            child
                .wait()
                .with_context(|| format!("failed to wait for: {}", spec.display_line()))?;
            false
        }
    };

    let stdout = stdout_thread.map(join_drained).unwrap_or_default();
    let stderr = stderr_thread.map(join_drained).unwrap_or_default();

    // After a kill the wait below reaps the child and yields no code.
    let exit_code = child
        .wait()
        .map(|status| status.code().unwrap_or(EXIT_CODE_UNAVAILABLE))
        .unwrap_or(EXIT_CODE_UNAVAILABLE);

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_drained(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Poll the child until it exits or `limit` elapses; kill on timeout.
///
/// Returns whether the deadline fired.
fn wait_with_deadline(child: &mut Child, start: Instant, limit: Duration) -> Result<bool> {
    loop {
        if child.try_wait().context("failed to poll child")?.is_some() {
            return Ok(false);
        }
        if start.elapsed() >= limit {
            child.kill().ok();
            return Ok(true);
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Human-readable timeout description for logs and degradation entries.
pub fn describe_timeout(limit: Duration) -> String {
    format!("timed out after {}", humantime::format_duration(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn shell(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn display_line_joins_program_and_args() {
        let spec = CommandSpec::new("cargo", ["test", "--workspace"]);
        assert_eq!(spec.display_line(), "cargo test --workspace");
    }

    #[test]
    fn resolve_program_fails_for_missing_binary() {
        let err = resolve_program("definitely-not-a-real-program-conductor").unwrap_err();
        assert!(format!("{err:#}").contains("not found on PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let out = run_captured(&shell("echo out; echo err >&2; exit 3"), None).expect("run");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[test]
    fn success_requires_zero_exit() {
        let out = run_captured(&shell("exit 0"), None).expect("run");
        assert!(out.success());
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_and_reports_timeout() {
        let out = run_captured(
            &shell("echo started; sleep 30"),
            Some(Duration::from_millis(200)),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration_ms < 10_000);
    }

    #[cfg(unix)]
    #[test]
    fn cwd_and_env_are_applied() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = shell("pwd; printf '%s' \"$CONDUCTOR_TEST_MARKER\"")
            .with_cwd(td.path())
            .with_env("CONDUCTOR_TEST_MARKER", "marker-42");
        let out = run_captured(&spec, None).expect("run");
        assert!(out.stdout.contains("marker-42"));
    }

    #[test]
    fn describe_timeout_is_human_readable() {
        assert_eq!(describe_timeout(Duration::from_secs(5)), "timed out after 5s");
    }
}
