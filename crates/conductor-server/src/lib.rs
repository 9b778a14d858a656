//! HTTP surface over the run ledger: a read-only projection plus the small
//! control set (start, pause, resume, cancel, escalation resolve).
//!
//! The server never reaches into kernel internals; everything it shows is
//! read back from the ledger, and every mutation goes through the
//! supervisor. The event feed tails `events.jsonl` lazily by byte offset,
//! so a live run streams without buffering transcripts.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use conductor::supervisor::Supervisor;
use conductor::types::{Decision, KernelEvent, RunSpec, RunStatus};
use conductor_events::EventStream;

/// Poll cadence for the SSE event tail.
const EVENT_POLL: Duration = Duration::from_millis(500);

/// Shared server state.
pub struct ServerState {
    pub supervisor: Arc<Supervisor>,
    /// Flow order shown by `/plan`.
    pub plan_order: Vec<String>,
}

type AppState = Arc<ServerState>;

/// JSON error body with the right status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn run_or_404(state: &ServerState, run_id: &str) -> Result<conductor::RunReport, ApiError> {
    match state.supervisor.report(run_id) {
        Ok(report) => Ok(report),
        Err(e) if format!("{e:#}").contains("no existing run state") => {
            Err(ApiError::not_found(format!("unknown run: {run_id}")))
        }
        Err(e) => Err(ApiError::internal(e)),
    }
}

// ---- read-only projection -------------------------------------------------

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    status: RunStatus,
    cumulative_cost: f64,
    active_flow: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn list_runs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.supervisor.list_runs().map_err(ApiError::internal)?;
    let summaries: Vec<RunSummary> = runs
        .into_iter()
        .map(|meta| RunSummary {
            run_id: meta.run_id,
            status: meta.status,
            cumulative_cost: meta.cumulative_cost,
            active_flow: meta.active_flow,
            created_at: meta.created_at,
        })
        .collect();
    Ok(axum::Json(summaries))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = run_or_404(&state, &run_id)?;
    Ok(axum::Json(report))
}

async fn get_plan(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .supervisor
        .flows()
        .plan_view(&state.plan_order)
        .map_err(ApiError::internal)?;
    Ok(axum::Json(view))
}

/// Aggregated governance state across all runs.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub kernel_ok: bool,
    pub runs_total: usize,
    pub runs_completed: usize,
    pub runs_escalated: usize,
    pub runs_aborted: usize,
    /// Completed over all terminal-or-escalated runs.
    pub governance_pass_rate: f64,
    pub degradations: usize,
    /// Acceptance-criteria IDs with at least one succeeded receipt.
    pub ac_covered: Vec<String>,
}

/// Fold run reports into the platform status. Pure, for testability.
pub fn aggregate_platform_status(reports: &[conductor::RunReport]) -> PlatformStatus {
    let mut status = PlatformStatus {
        kernel_ok: true,
        ..PlatformStatus::default()
    };
    let mut ac_covered = std::collections::BTreeSet::new();

    for report in reports {
        status.runs_total += 1;
        match report.meta.status {
            RunStatus::Completed => status.runs_completed += 1,
            RunStatus::Escalated => status.runs_escalated += 1,
            RunStatus::Aborted => status.runs_aborted += 1,
            _ => {}
        }
        for flow in &report.flows {
            status.degradations += flow.degradations;
            ac_covered.extend(flow.ac_covered.iter().cloned());
        }
    }

    let settled = status.runs_completed + status.runs_escalated + status.runs_aborted;
    status.governance_pass_rate = if settled == 0 {
        1.0
    } else {
        status.runs_completed as f64 / settled as f64
    };
    status.ac_covered = ac_covered.into_iter().collect();
    status
}

async fn platform_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.supervisor.list_runs().map_err(ApiError::internal)?;
    let mut reports = Vec::new();
    for meta in runs {
        reports.push(
            state
                .supervisor
                .report(&meta.run_id)
                .map_err(ApiError::internal)?,
        );
    }
    Ok(axum::Json(aggregate_platform_status(&reports)))
}

// ---- event stream ---------------------------------------------------------

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, ApiError> {
    run_or_404(&state, &run_id)?;

    let events_path = state.supervisor.kernel().ledger.events_path(&run_id);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let stream = EventStream::new(events_path);
        let mut offset = 0u64;
        loop {
            let batch: Vec<KernelEvent> = match stream.tail_from(offset) {
                Ok((batch, next)) => {
                    offset = next;
                    batch
                }
                Err(e) => {
                    warn!("event tail failed: {e:#}");
                    break;
                }
            };
            for event in batch {
                let data = match serde_json::to_string(&event) {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                if tx.send(Ok(Event::default().data(data))).await.is_err() {
                    // Client went away.
                    return;
                }
            }
            tokio::time::sleep(EVENT_POLL).await;
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

// ---- control --------------------------------------------------------------

async fn start_run(
    State(state): State<AppState>,
    axum::Json(spec): axum::Json<RunSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state
        .supervisor
        .prepare_run(spec)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;

    let supervisor = state.supervisor.clone();
    let drive_id = run_id.clone();
    std::thread::spawn(move || {
        let mut reporter = conductor::NullReporter;
        if let Err(e) = supervisor.drive_run(&drive_id, &mut reporter) {
            warn!("run {drive_id} failed: {e:#}");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "run_id": run_id })),
    ))
}

async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    run_or_404(&state, &run_id)?;
    state
        .supervisor
        .pause(&run_id)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(axum::Json(serde_json::json!({ "run_id": run_id, "paused": true })))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    run_or_404(&state, &run_id)?;

    let supervisor = state.supervisor.clone();
    let drive_id = run_id.clone();
    std::thread::spawn(move || {
        let mut reporter = conductor::NullReporter;
        if let Err(e) = supervisor.resume(&drive_id, &mut reporter) {
            warn!("resume {drive_id} failed: {e:#}");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "run_id": run_id, "resuming": true })),
    ))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    run_or_404(&state, &run_id)?;
    state
        .supervisor
        .cancel(&run_id)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(axum::Json(serde_json::json!({ "run_id": run_id, "cancelling": true })))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    decision: String,
    #[serde(default)]
    note: String,
}

async fn resolve_escalation(
    State(state): State<AppState>,
    Path((run_id, key)): Path<(String, String)>,
    axum::Json(body): axum::Json<ResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
    run_or_404(&state, &run_id)?;

    let Some(decision) = Decision::parse(&body.decision) else {
        return Err(ApiError::bad_request(format!(
            "decision outside the routing vocabulary: {}",
            body.decision
        )));
    };

    let escalation = state
        .supervisor
        .resolve_escalation(&run_id, &key, decision, &body.note)
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(axum::Json(escalation))
}

// ---- wiring ---------------------------------------------------------------

/// Build the router over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/events", get(run_events))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/escalation/{key}/resolve", post(resolve_escalation))
        .route("/plan", get(get_plan))
        .route("/platform/status", get(platform_status))
        .with_state(state)
}

/// Serve until interrupted, on a runtime owned by this call.
pub fn serve_blocking(addr: SocketAddr, state: ServerState) -> Result<()> {
    let _ = tracing_subscriber::fmt().try_init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build server runtime")?;

    runtime.block_on(async move {
        let app = router(Arc::new(state));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("conductor server listening on {addr}");
        axum::serve(listener, app)
            .await
            .context("server terminated")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus, degradations: usize, ac: &[&str]) -> conductor::RunReport {
        conductor::RunReport {
            meta: conductor::types::RunMeta {
                schema_version: conductor::types::CURRENT_META_VERSION.to_string(),
                run_id: "run-x".to_string(),
                spec: RunSpec {
                    flows: vec!["build".to_string()],
                    mode: conductor::types::EngineMode::Stub,
                    budget_usd: 1.0,
                    signal: String::new(),
                },
                created_at: chrono::Utc::now(),
                status,
                cumulative_cost: 0.0,
                active_flow: None,
                abort_reason: None,
                notified: false,
                environment: conductor::types::EnvironmentFingerprint::collect(),
            },
            flows: vec![conductor::supervisor::FlowReport {
                flow_key: "build".to_string(),
                committed_steps: vec![],
                receipts: 0,
                degradations,
                routing_decisions: 0,
                ac_covered: ac.iter().map(|a| a.to_string()).collect(),
            }],
            open_escalations: vec![],
        }
    }

    #[test]
    fn platform_status_aggregates_runs() {
        let reports = vec![
            report(RunStatus::Completed, 0, &["AC-1"]),
            report(RunStatus::Completed, 2, &["AC-2"]),
            report(RunStatus::Escalated, 1, &[]),
            report(RunStatus::Running, 0, &[]),
        ];
        let status = aggregate_platform_status(&reports);
        assert_eq!(status.runs_total, 4);
        assert_eq!(status.runs_completed, 2);
        assert_eq!(status.runs_escalated, 1);
        assert_eq!(status.degradations, 3);
        assert!((status.governance_pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(status.ac_covered, vec!["AC-1".to_string(), "AC-2".to_string()]);
    }

    #[test]
    fn platform_status_with_no_settled_runs_passes() {
        let status = aggregate_platform_status(&[report(RunStatus::Running, 0, &[])]);
        assert_eq!(status.governance_pass_rate, 1.0);
    }
}
