use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use conductor::config::Config;
use conductor::report::Reporter;
use conductor::supervisor::Supervisor;
use conductor::types::{Decision, EngineMode, RunSpec, RunStatus};

/// Exit codes: 0 success, 1 governance failure, 2 kernel failure,
/// 3 budget exhausted, 4 boundary violation.
const EXIT_SUCCESS: i32 = 0;
const EXIT_GOVERNANCE: i32 = 1;
const EXIT_KERNEL: i32 = 2;
const EXIT_BUDGET: i32 = 3;
const EXIT_BOUNDARY: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "conductor", version)]
#[command(about = "Deterministic orchestration kernel for multi-stage agent flows")]
struct Cli {
    /// Path to conductor.toml
    #[arg(long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a run over the given flows.
    Run {
        /// Flow keys in execution order (comma separated).
        #[arg(long, value_delimiter = ',', default_value = "signal,plan,build,gate")]
        flows: Vec<String>,

        /// Backend engine: stub, cli, or sdk.
        #[arg(long)]
        mode: Option<String>,

        /// Run budget cap in USD.
        #[arg(long = "budget-usd")]
        budget_usd: Option<f64>,

        /// Free-form description of the input signal.
        #[arg(long, default_value = "")]
        signal: String,
    },
    /// Resume a run from its last checkpoint.
    Resume { run_id: String },
    /// Show the ledger-backed state of a run.
    Status { run_id: String },
    /// Print the declared flow/step plan.
    Plan {
        #[arg(long, value_delimiter = ',', default_value = "signal,plan,build,gate")]
        flows: Vec<String>,
    },
    /// Resolve an open escalation with a routing-vocabulary decision.
    Resolve {
        run_id: String,
        key: String,
        decision: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Run the layered health check (KERNEL, GOVERNANCE, OPTIONAL).
    Selftest,
    /// Serve the status and control endpoints.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7700")]
        addr: SocketAddr,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[error] {e:#}");
            EXIT_KERNEL
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run {
            flows,
            mode,
            budget_usd,
            signal,
        } => {
            let mut config = Config::load(Some(&cli.config))?;
            if let Some(mode) = &mode {
                config.kernel.mode = EngineMode::parse(mode)
                    .with_context(|| format!("unknown mode: {mode} (stub, cli, sdk)"))?;
            }
            if let Some(budget) = budget_usd {
                config.kernel.budget_usd = budget;
            }

            let supervisor = Supervisor::from_config(&config)?;
            let spec = RunSpec {
                flows,
                mode: config.kernel.mode,
                budget_usd: config.kernel.budget_usd,
                signal,
            };

            let mut reporter = CliReporter;
            let report = supervisor.start_run(spec, &mut reporter)?;
            print_report(&report);
            Ok(exit_code_for(&report))
        }
        Commands::Resume { run_id } => {
            let config = Config::load(Some(&cli.config))?;
            let supervisor = Supervisor::from_config(&config)?;
            let mut reporter = CliReporter;
            let report = supervisor.resume(&run_id, &mut reporter)?;
            print_report(&report);
            Ok(exit_code_for(&report))
        }
        Commands::Status { run_id } => {
            let config = Config::load(Some(&cli.config))?;
            let supervisor = Supervisor::from_config(&config)?;
            let report = supervisor.report(&run_id)?;
            print_report(&report);
            Ok(EXIT_SUCCESS)
        }
        Commands::Plan { flows } => {
            let config = Config::load(Some(&cli.config))?;
            let supervisor = Supervisor::from_config(&config)?;
            let view = supervisor.flows().plan_view(&flows)?;
            print_plan(&view);
            Ok(EXIT_SUCCESS)
        }
        Commands::Resolve {
            run_id,
            key,
            decision,
            note,
        } => {
            let parsed = Decision::parse(&decision).with_context(|| {
                format!("decision outside the routing vocabulary: {decision}")
            })?;
            let config = Config::load(Some(&cli.config))?;
            let supervisor = Supervisor::from_config(&config)?;
            let escalation = supervisor.resolve_escalation(&run_id, &key, parsed, &note)?;
            println!("resolved {key}: {:?}", parsed);
            println!("{}", serde_json::to_string_pretty(&escalation)?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Selftest => {
            let report = conductor::selftest::run_selftest();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.exit_code())
        }
        Commands::Serve { addr } => {
            let config = Config::load(Some(&cli.config))?;
            let supervisor = Arc::new(Supervisor::from_config(&config)?);
            let state = conductor_server::ServerState {
                supervisor,
                plan_order: vec![
                    "signal".to_string(),
                    "plan".to_string(),
                    "build".to_string(),
                    "gate".to_string(),
                ],
            };
            conductor_server::serve_blocking(addr, state)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(EXIT_SUCCESS)
        }
    }
}

fn exit_code_for(report: &conductor::RunReport) -> i32 {
    match report.meta.status {
        RunStatus::Completed => EXIT_SUCCESS,
        RunStatus::Aborted => match report.meta.abort_reason.as_deref() {
            Some("budget_exhausted") => EXIT_BUDGET,
            _ => EXIT_KERNEL,
        },
        RunStatus::Escalated => {
            let boundary = report
                .open_escalations
                .iter()
                .any(|e| e.reason.contains("boundary violation"));
            if boundary { EXIT_BOUNDARY } else { EXIT_GOVERNANCE }
        }
        // Paused / running / pending stops are not failures.
        _ => EXIT_SUCCESS,
    }
}

fn print_report(report: &conductor::RunReport) {
    println!("run_id: {}", report.meta.run_id);
    println!("status: {:?}", report.meta.status);
    println!(
        "cost:   {:.4} / {:.4} USD",
        report.meta.cumulative_cost, report.meta.spec.budget_usd
    );
    let age = (chrono::Utc::now() - report.meta.created_at)
        .to_std()
        .unwrap_or_default();
    println!(
        "age:    {}",
        humantime::format_duration(std::time::Duration::from_secs(age.as_secs()))
    );
    if let Some(reason) = &report.meta.abort_reason {
        println!("reason: {reason}");
    }
    println!();

    for flow in &report.flows {
        println!(
            "{}: {} receipt(s), {} decision(s), {} degradation(s)",
            flow.flow_key, flow.receipts, flow.routing_decisions, flow.degradations
        );
        for step in &flow.committed_steps {
            println!("  - {step}");
        }
    }

    if !report.open_escalations.is_empty() {
        println!();
        println!("open escalations:");
        for escalation in &report.open_escalations {
            println!(
                "  {} ({}/{}): {}",
                escalation.key, escalation.flow_key, escalation.step_id, escalation.reason
            );
        }
    }
}

fn print_plan(view: &conductor::plan::PlanView) {
    for flow in &view.flows {
        println!("{}: {}", flow.flow_key, flow.goal);
        for (idx, step) in flow.steps.iter().enumerate() {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" (after {})", step.depends_on.join(", "))
            };
            let kind = match &step.skill {
                Some(skill) => format!("skill:{skill}"),
                None if step.microloop => format!("{} + critic loop", step.agent_key),
                None => step.agent_key.clone(),
            };
            println!("{:>3}. {} [{:?}] {}{}", idx + 1, step.step_id, step.tier, kind, deps);
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    fn escalation(reason: &str) -> conductor::types::Escalation {
        conductor::types::Escalation {
            key: "esc-1".to_string(),
            flow_key: "gate".to_string(),
            step_id: "publish".to_string(),
            reason: reason.to_string(),
            raised_at: chrono::Utc::now(),
            resolution: None,
        }
    }

    fn report_with(status: RunStatus, abort_reason: Option<&str>, esc: Vec<conductor::types::Escalation>) -> conductor::RunReport {
        conductor::RunReport {
            meta: conductor::types::RunMeta {
                schema_version: conductor::types::CURRENT_META_VERSION.to_string(),
                run_id: "run-t".to_string(),
                spec: RunSpec {
                    flows: vec!["build".to_string()],
                    mode: EngineMode::Stub,
                    budget_usd: 1.0,
                    signal: String::new(),
                },
                created_at: chrono::Utc::now(),
                status,
                cumulative_cost: 0.0,
                active_flow: None,
                abort_reason: abort_reason.map(String::from),
                notified: false,
                environment: conductor::types::EnvironmentFingerprint::collect(),
            },
            flows: vec![],
            open_escalations: esc,
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(
            exit_code_for(&report_with(RunStatus::Completed, None, vec![])),
            EXIT_SUCCESS
        );
        assert_eq!(
            exit_code_for(&report_with(
                RunStatus::Aborted,
                Some("budget_exhausted"),
                vec![]
            )),
            EXIT_BUDGET
        );
        assert_eq!(
            exit_code_for(&report_with(RunStatus::Aborted, Some("fatal:oops"), vec![])),
            EXIT_KERNEL
        );
        assert_eq!(
            exit_code_for(&report_with(
                RunStatus::Escalated,
                None,
                vec![escalation("navigator_error")]
            )),
            EXIT_GOVERNANCE
        );
        assert_eq!(
            exit_code_for(&report_with(
                RunStatus::Escalated,
                None,
                vec![escalation("boundary violation: secret detected in diff")]
            )),
            EXIT_BOUNDARY
        );
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "conductor",
            "run",
            "--flows",
            "signal,build",
            "--mode",
            "stub",
            "--budget-usd",
            "12.5",
        ]);
        match cli.cmd {
            Commands::Run {
                flows,
                mode,
                budget_usd,
                ..
            } => {
                assert_eq!(flows, vec!["signal".to_string(), "build".to_string()]);
                assert_eq!(mode.as_deref(), Some("stub"));
                assert_eq!(budget_usd, Some(12.5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn stub_run_completes_end_to_end() {
        let td = tempdir().expect("tempdir");
        unsafe {
            std::env::set_var("CONDUCTOR_RUN_BASE", td.path().join("runs"));
        }

        let config = Config::load(None).expect("config");
        let supervisor = Supervisor::from_config(&config).expect("supervisor");
        let spec = RunSpec {
            flows: vec!["signal".to_string(), "gate".to_string()],
            mode: EngineMode::Stub,
            budget_usd: 5.0,
            signal: "smoke".to_string(),
        };

        let mut reporter = CliReporter;
        let report = supervisor.start_run(spec, &mut reporter).expect("run");
        assert_eq!(report.meta.status, RunStatus::Completed);
        assert_eq!(exit_code_for(&report), EXIT_SUCCESS);

        unsafe {
            std::env::remove_var("CONDUCTOR_RUN_BASE");
        }
    }

    #[test]
    fn plan_rendering_covers_builtin_flows() {
        let config = Config::default();
        let supervisor = Supervisor::from_config(&config).expect("supervisor");
        let view = supervisor
            .flows()
            .plan_view(&["build".to_string()])
            .expect("plan");
        assert_eq!(view.flows.len(), 1);
        assert!(view.flows[0].steps.iter().any(|s| s.step_id == "implement"));
    }
}
