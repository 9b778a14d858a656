//! Kernel configuration: `conductor.toml`, overridden by environment
//! variables, overridden by CLI flags. Credentials are never part of the
//! file; backends name the environment variable they read instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use conductor_process::CommandSpec;

use crate::gate::GatePolicy;
use crate::routing::DetourRule;
use crate::types::{EngineMode, FlowSpec};

/// `[kernel]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Root directory for run ledgers.
    pub run_base: PathBuf,
    pub mode: EngineMode,
    /// Default run budget cap in USD.
    pub budget_usd: f64,
    /// Commit the workspace evidence is bound to. Resolved externally;
    /// `unknown` disables freshness passes in stub setups.
    pub commit_sha: String,
    /// Seconds before a run lock is considered stale.
    pub lock_stale_secs: u64,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            run_base: PathBuf::from(".conductor/runs"),
            mode: EngineMode::Stub,
            budget_usd: 25.0,
            commit_sha: "unknown".to_string(),
            lock_stale_secs: 3600,
        }
    }
}

/// `[navigator]` section. Absent means escalate-on-doubt without advice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigatorSettings {
    pub url: String,
    pub model: String,
}

/// `[webhook]` section: escalation/abort notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

/// `[backend.cli]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliBackendSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CliBackendSettings {
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.program.clone(), self.args.clone())
    }
}

/// `[backend.sdk]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkBackendSettings {
    pub url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    "CONDUCTOR_API_TOKEN".to_string()
}

/// `[backends]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub cli: Option<CliBackendSettings>,
    #[serde(default)]
    pub sdk: Option<SdkBackendSettings>,
}

/// One `[skills.<name>]` entry.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Per-skill tool timeout override, in seconds.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl SkillSettings {
    pub fn command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program.clone(), self.args.clone());
        if let Some(cwd) = &self.cwd {
            spec = spec.with_cwd(cwd.clone());
        }
        spec
    }
}

/// The full configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kernel: KernelSettings,
    pub navigator: Option<NavigatorSettings>,
    pub webhook: Option<WebhookSettings>,
    pub backend: BackendSettings,
    pub skills: BTreeMap<String, SkillSettings>,
    pub detours: Vec<DetourRule>,
    pub gate: GatePolicy,
    /// Extra flows layered over the built-ins; same key replaces.
    pub flows: Vec<FlowSpec>,
}

impl Config {
    /// Load from `path` when it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base) = std::env::var("CONDUCTOR_RUN_BASE") {
            self.kernel.run_base = PathBuf::from(base);
        }
        if let Ok(mode) = std::env::var("CONDUCTOR_MODE") {
            if let Some(mode) = EngineMode::parse(&mode) {
                self.kernel.mode = mode;
            }
        }
        if let Ok(budget) = std::env::var("CONDUCTOR_BUDGET_USD") {
            if let Ok(budget) = budget.parse::<f64>() {
                self.kernel.budget_usd = budget;
            }
        }
        if let Ok(sha) = std::env::var("CONDUCTOR_COMMIT_SHA") {
            self.kernel.commit_sha = sha;
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.kernel.lock_stale_secs)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const SAMPLE: &str = r#"
[kernel]
run_base = "/var/lib/conductor/runs"
mode = "cli"
budget_usd = 50.0
commit_sha = "abc123"

[navigator]
url = "http://localhost:9000/advise"
model = "small-router"

[backend.cli]
program = "agent"
args = ["--quiet"]

[skills.test-runner]
program = "cargo"
args = ["test", "--workspace"]
timeout = 600

[skills.auto-linter]
program = "cargo"
args = ["fmt"]

[[detours]]
signature = "lint-sig"
target_skill = "auto-linter"

[gate]
sandbox_ref_prefixes = ["refs/heads/sandbox/"]
"#;

    #[test]
    #[serial]
    fn sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE).expect("parse");
        assert_eq!(config.kernel.mode, EngineMode::Cli);
        assert_eq!(config.kernel.budget_usd, 50.0);
        assert_eq!(config.navigator.expect("navigator").model, "small-router");
        assert_eq!(config.skills.len(), 2);
        assert_eq!(
            config.skills["test-runner"].timeout,
            Some(Duration::from_secs(600))
        );
        assert!(config.skills["auto-linter"].timeout.is_none());
        assert_eq!(config.detours.len(), 1);
        assert!(config.gate.in_sandbox("refs/heads/sandbox/x"));
    }

    #[test]
    #[serial]
    fn defaults_cover_missing_file() {
        let config = Config::load(Some(Path::new("/definitely/not/here.toml"))).expect("load");
        assert_eq!(config.kernel.mode, EngineMode::Stub);
        assert_eq!(config.kernel.budget_usd, 25.0);
        assert!(config.backend.cli.is_none());
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn env_overrides_win_over_file_values() {
        unsafe {
            std::env::set_var("CONDUCTOR_MODE", "sdk");
            std::env::set_var("CONDUCTOR_BUDGET_USD", "5.5");
        }

        let mut config: Config = toml::from_str(SAMPLE).expect("parse");
        config.apply_env_overrides();
        assert_eq!(config.kernel.mode, EngineMode::Sdk);
        assert_eq!(config.kernel.budget_usd, 5.5);

        unsafe {
            std::env::remove_var("CONDUCTOR_MODE");
            std::env::remove_var("CONDUCTOR_BUDGET_USD");
        }
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn invalid_env_values_are_ignored() {
        unsafe {
            std::env::set_var("CONDUCTOR_MODE", "quantum");
            std::env::set_var("CONDUCTOR_BUDGET_USD", "not-a-number");
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.kernel.mode, EngineMode::Stub);
        assert_eq!(config.kernel.budget_usd, 25.0);

        unsafe {
            std::env::remove_var("CONDUCTOR_MODE");
            std::env::remove_var("CONDUCTOR_BUDGET_USD");
        }
    }

    #[test]
    fn skill_settings_build_command_specs() {
        let settings = SkillSettings {
            program: "cargo".to_string(),
            args: vec!["test".to_string()],
            cwd: Some(PathBuf::from("/repo")),
            timeout: None,
        };
        let spec = settings.command();
        assert_eq!(spec.display_line(), "cargo test");
        assert_eq!(spec.cwd, Some(PathBuf::from("/repo")));
    }
}
