//! The append-only, disk-first artifact store for runs.
//!
//! Layout per run root `RUN_BASE/<run_id>/`:
//!
//! ```text
//! meta.json                      run meta (rewritten atomically)
//! events.jsonl                   kernel events
//! escalations.jsonl              raised/resolved escalations
//! lock                           supervisor lock
//! <flow>/receipts/<step>-<agent>.json
//! <flow>/handoffs/<step>-<agent>.json
//! <flow>/llm/<step>-<agent>-<engine>.jsonl
//! <flow>/routing/decisions.jsonl
//! <flow>/scent_trail.json
//! <flow>/degradations.jsonl
//! <flow>/logs/<step>.jsonl
//! <flow>/forensics/<incident>/
//! <flow>/quarantine/             corrupt or retired entities
//! ```
//!
//! Receipts, handoffs, and the decision stream are never rewritten;
//! corrections are new entries. Every string is redacted before it touches
//! disk. Writes land in a temp name, fsync, then rename, so a crash leaves
//! either the old file or the new one, never a torn write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use conductor_events::EventStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::schema;
use crate::types::{
    Escalation, EscalationResolution, Handoff, KernelEvent, Receipt, RoutingRecord, RunMeta,
    ScentEntry, StepLogEntry,
};

pub const META_FILE: &str = "meta.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const ESCALATIONS_FILE: &str = "escalations.jsonl";
pub const SCENT_FILE: &str = "scent_trail.json";
pub const DECISIONS_FILE: &str = "decisions.jsonl";
pub const DEGRADATIONS_FILE: &str = "degradations.jsonl";

/// Errors surfaced by ledger commit operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A committed entity already exists at this path.
    #[error("already committed: {path}")]
    AlreadyCommitted { path: PathBuf },

    /// Transient for the caller per the reliability contract.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Handle on the run store rooted at `RUN_BASE`.
#[derive(Debug, Clone)]
pub struct Ledger {
    base: PathBuf,
}

/// Receipts plus the paths of files quarantined while listing.
#[derive(Debug, Default)]
pub struct ReceiptListing {
    pub receipts: Vec<Receipt>,
    pub quarantined: Vec<PathBuf>,
}

impl Ledger {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    // ---- path helpers -----------------------------------------------------

    pub fn run_root(&self, run_id: &str) -> PathBuf {
        self.base.join(run_id)
    }

    pub fn meta_path(&self, run_id: &str) -> PathBuf {
        self.run_root(run_id).join(META_FILE)
    }

    pub fn flow_dir(&self, run_id: &str, flow_key: &str) -> PathBuf {
        self.run_root(run_id).join(flow_key)
    }

    pub fn receipt_path(&self, run_id: &str, flow_key: &str, step_id: &str, agent_key: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key)
            .join("receipts")
            .join(format!("{step_id}-{agent_key}.json"))
    }

    pub fn handoff_path(&self, run_id: &str, flow_key: &str, step_id: &str, agent_key: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key)
            .join("handoffs")
            .join(format!("{step_id}-{agent_key}.json"))
    }

    pub fn transcript_path(
        &self,
        run_id: &str,
        flow_key: &str,
        step_id: &str,
        agent_key: &str,
        engine: &str,
    ) -> PathBuf {
        self.flow_dir(run_id, flow_key)
            .join("llm")
            .join(format!("{step_id}-{agent_key}-{engine}.jsonl"))
    }

    pub fn step_log_path(&self, run_id: &str, flow_key: &str, step_id: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key)
            .join("logs")
            .join(format!("{step_id}.jsonl"))
    }

    pub fn forensics_dir(&self, run_id: &str, flow_key: &str, incident: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key).join("forensics").join(incident)
    }

    fn quarantine_dir(&self, run_id: &str, flow_key: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key).join("quarantine")
    }

    fn decisions_stream(&self, run_id: &str, flow_key: &str) -> EventStream {
        EventStream::new(
            self.flow_dir(run_id, flow_key)
                .join("routing")
                .join(DECISIONS_FILE),
        )
    }

    fn degradations_stream(&self, run_id: &str, flow_key: &str) -> EventStream {
        EventStream::new(self.flow_dir(run_id, flow_key).join(DEGRADATIONS_FILE))
    }

    fn events_stream(&self, run_id: &str) -> EventStream {
        EventStream::new(self.run_root(run_id).join(EVENTS_FILE))
    }

    fn escalations_stream(&self, run_id: &str) -> EventStream {
        EventStream::new(self.run_root(run_id).join(ESCALATIONS_FILE))
    }

    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_root(run_id).join(EVENTS_FILE)
    }

    pub fn scent_path(&self, run_id: &str, flow_key: &str) -> PathBuf {
        self.flow_dir(run_id, flow_key).join(SCENT_FILE)
    }

    // ---- commits ----------------------------------------------------------

    /// Commit a receipt. Atomic, and refuses to overwrite an existing
    /// committed receipt.
    pub fn write_receipt(&self, receipt: &Receipt) -> Result<(), LedgerError> {
        let path = self.receipt_path(
            &receipt.run_id,
            &receipt.flow_key,
            &receipt.step_id,
            &receipt.agent_key,
        );
        if path.exists() {
            return Err(LedgerError::AlreadyCommitted { path });
        }
        atomic_write_redacted(&path, receipt, "receipt")
    }

    /// Commit a handoff envelope. Same overwrite refusal as receipts.
    pub fn write_handoff(&self, run_id: &str, handoff: &Handoff) -> Result<(), LedgerError> {
        let path = self.handoff_path(
            run_id,
            &handoff.meta.flow_key,
            &handoff.meta.step_id,
            &handoff.meta.agent_key,
        );
        if path.exists() {
            return Err(LedgerError::AlreadyCommitted { path });
        }
        atomic_write_redacted(&path, handoff, "handoff")
    }

    /// Rewrite run meta. Meta is mutable run state, not a committed entity.
    pub fn write_meta(&self, meta: &RunMeta) -> Result<(), LedgerError> {
        atomic_write_redacted(&self.meta_path(&meta.run_id), meta, "run meta")
    }

    pub fn read_meta(&self, run_id: &str) -> Result<Option<RunMeta>> {
        let path = self.meta_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("io error reading {}", path.display()))?;
        let meta = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse run meta {}", path.display()))?;
        Ok(Some(meta))
    }

    // ---- append-only streams ---------------------------------------------

    pub fn append_routing(
        &self,
        run_id: &str,
        flow_key: &str,
        record: &RoutingRecord,
    ) -> Result<()> {
        append_redacted(&self.decisions_stream(run_id, flow_key), record)
    }

    pub fn routing_decisions(&self, run_id: &str, flow_key: &str) -> Result<Vec<RoutingRecord>> {
        self.decisions_stream(run_id, flow_key).read_all()
    }

    /// Append one scent entry. The trail is a JSON array file; the previous
    /// entries are preserved verbatim and the new entry lands at the end.
    pub fn append_scent(&self, run_id: &str, flow_key: &str, entry: &ScentEntry) -> Result<()> {
        let path = self.scent_path(run_id, flow_key);
        let mut trail: Vec<ScentEntry> = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("io error reading {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse scent trail {}", path.display()))?
        } else {
            Vec::new()
        };
        trail.push(entry.clone());
        atomic_write_redacted(&path, &trail, "scent trail")
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub fn scent_trail(&self, run_id: &str, flow_key: &str) -> Result<Vec<ScentEntry>> {
        let path = self.scent_path(run_id, flow_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("io error reading {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scent trail {}", path.display()))
    }

    pub fn append_degradation(
        &self,
        run_id: &str,
        flow_key: &str,
        degradation: &crate::types::Degradation,
    ) -> Result<()> {
        append_redacted(&self.degradations_stream(run_id, flow_key), degradation)
    }

    pub fn degradations(&self, run_id: &str, flow_key: &str) -> Result<Vec<crate::types::Degradation>> {
        self.degradations_stream(run_id, flow_key).read_all()
    }

    pub fn append_event(&self, run_id: &str, event: &KernelEvent) -> Result<()> {
        append_redacted(&self.events_stream(run_id), event)
    }

    pub fn events(&self, run_id: &str) -> Result<Vec<KernelEvent>> {
        self.events_stream(run_id).read_all()
    }

    pub fn append_step_log(
        &self,
        run_id: &str,
        flow_key: &str,
        step_id: &str,
        entry: &StepLogEntry,
    ) -> Result<()> {
        append_redacted(
            &EventStream::new(self.step_log_path(run_id, flow_key, step_id)),
            entry,
        )
    }

    pub fn step_log(&self, run_id: &str, flow_key: &str, step_id: &str) -> Result<Vec<StepLogEntry>> {
        EventStream::new(self.step_log_path(run_id, flow_key, step_id)).read_all()
    }

    // ---- escalations ------------------------------------------------------

    pub fn append_escalation(&self, run_id: &str, escalation: &Escalation) -> Result<()> {
        append_redacted(&self.escalations_stream(run_id), escalation)
    }

    /// Raised escalations folded with their resolutions, latest entry wins.
    pub fn escalations(&self, run_id: &str) -> Result<Vec<Escalation>> {
        let entries: Vec<Escalation> = self.escalations_stream(run_id).read_all()?;
        let mut folded: Vec<Escalation> = Vec::new();
        for entry in entries {
            match folded.iter_mut().find(|e| e.key == entry.key) {
                Some(existing) => *existing = entry,
                None => folded.push(entry),
            }
        }
        Ok(folded)
    }

    /// Record a resolution by appending the escalation with its resolution
    /// attached. The original raised entry stays in the stream.
    pub fn resolve_escalation(
        &self,
        run_id: &str,
        key: &str,
        resolution: EscalationResolution,
    ) -> Result<Escalation> {
        let escalations = self.escalations(run_id)?;
        let mut escalation = escalations
            .into_iter()
            .find(|e| e.key == key)
            .with_context(|| format!("unknown identifier: escalation {key}"))?;
        if escalation.resolution.is_some() {
            anyhow::bail!("escalation {key} is already resolved");
        }
        escalation.resolution = Some(resolution);
        self.append_escalation(run_id, &escalation)?;
        Ok(escalation)
    }

    // ---- reads ------------------------------------------------------------

    /// Read one receipt, quarantining it on parse failure.
    pub fn read_receipt(
        &self,
        run_id: &str,
        flow_key: &str,
        step_id: &str,
        agent_key: &str,
    ) -> Result<Option<Receipt>> {
        let path = self.receipt_path(run_id, flow_key, step_id, agent_key);
        if !path.exists() {
            return Ok(None);
        }
        match schema::read_receipt_migrating(&path) {
            Ok(receipt) => Ok(Some(receipt)),
            Err(_) => {
                self.quarantine(run_id, flow_key, &path)?;
                Ok(None)
            }
        }
    }

    pub fn has_receipt(&self, run_id: &str, flow_key: &str, step_id: &str, agent_key: &str) -> bool {
        self.receipt_path(run_id, flow_key, step_id, agent_key).exists()
    }

    pub fn has_handoff(&self, run_id: &str, flow_key: &str, step_id: &str, agent_key: &str) -> bool {
        self.handoff_path(run_id, flow_key, step_id, agent_key).exists()
    }

    pub fn read_handoff(
        &self,
        run_id: &str,
        flow_key: &str,
        step_id: &str,
        agent_key: &str,
    ) -> Result<Option<Handoff>> {
        let path = self.handoff_path(run_id, flow_key, step_id, agent_key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("io error reading {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(handoff) => Ok(Some(handoff)),
            Err(_) => {
                self.quarantine(run_id, flow_key, &path)?;
                Ok(None)
            }
        }
    }

    /// All committed receipts for a flow, in commit order. Corrupt files are
    /// quarantined and reported, never silently skipped.
    pub fn list_receipts(&self, run_id: &str, flow_key: &str) -> Result<ReceiptListing> {
        let dir = self.flow_dir(run_id, flow_key).join("receipts");
        let mut listing = ReceiptListing::default();
        if !dir.exists() {
            return Ok(listing);
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("io error reading {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            match schema::read_receipt_migrating(&path) {
                Ok(receipt) => listing.receipts.push(receipt),
                Err(_) => {
                    self.quarantine(run_id, flow_key, &path)?;
                    listing.quarantined.push(path);
                }
            }
        }

        // Commit order: completion time, step id as tiebreaker.
        listing
            .receipts
            .sort_by(|a, b| (a.completed_at, &a.step_id).cmp(&(b.completed_at, &b.step_id)));
        Ok(listing)
    }

    /// Last committed step for a flow, used by the supervisor on resume.
    pub fn read_last_checkpoint(&self, run_id: &str, flow_key: &str) -> Result<Option<String>> {
        let listing = self.list_receipts(run_id, flow_key)?;
        Ok(listing.receipts.last().map(|r| r.step_id.clone()))
    }

    // ---- recovery ---------------------------------------------------------

    /// Move a corrupt or superseded entity aside. The original bytes are
    /// preserved under `quarantine/` for forensics.
    pub fn quarantine(&self, run_id: &str, flow_key: &str, path: &Path) -> Result<PathBuf> {
        let dir = self.quarantine_dir(run_id, flow_key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("io error creating {}", dir.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let target = dir.join(format!("{file_name}.{stamp}"));
        fs::rename(path, &target)
            .with_context(|| format!("io error quarantining {}", path.display()))?;
        Ok(target)
    }

    /// Retire an incomplete step (receipt committed, no handoff) before a
    /// retry from scratch. The stale receipt moves to quarantine so at most
    /// one committed receipt exists at any time.
    pub fn retire_incomplete_receipt(
        &self,
        run_id: &str,
        flow_key: &str,
        step_id: &str,
        agent_key: &str,
    ) -> Result<Option<PathBuf>> {
        let path = self.receipt_path(run_id, flow_key, step_id, agent_key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.quarantine(run_id, flow_key, &path)?))
    }

    /// Snapshot run state into a forensics incident directory.
    pub fn forensics_snapshot(
        &self,
        run_id: &str,
        flow_key: &str,
        incident: &str,
        detail: &serde_json::Value,
    ) -> Result<PathBuf> {
        let dir = self.forensics_dir(run_id, flow_key, incident);
        fs::create_dir_all(&dir)
            .with_context(|| format!("io error creating {}", dir.display()))?;

        let snapshot = serde_json::json!({
            "at": Utc::now(),
            "run_id": run_id,
            "flow_key": flow_key,
            "incident": incident,
            "meta": self.read_meta(run_id)?,
            "detail": detail,
        });
        let path = dir.join("snapshot.json");
        atomic_write_redacted(&path, &snapshot, "forensics snapshot")
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(path)
    }
}

/// Serialize, redact, then write via temp-name + fsync + rename.
fn atomic_write_redacted<T: Serialize>(
    path: &Path,
    value: &T,
    what: &'static str,
) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|source| LedgerError::Serialize { what, source })?;
    let json = conductor_redact::redact(&json);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|source| LedgerError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        file.write_all(json.as_bytes())
            .map_err(|source| LedgerError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        file.sync_all().map_err(|source| LedgerError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Append one redacted entry to a JSONL stream.
fn append_redacted<T: Serialize>(stream: &EventStream, entry: &T) -> Result<()> {
    let json = serde_json::to_string(entry).context("failed to serialize stream entry")?;
    let json = conductor_redact::redact(&json);
    let value: serde_json::Value =
        serde_json::from_str(&json).context("redacted entry is not valid JSON")?;
    stream.append(&value)
}

/// Read a typed JSON file, tolerating absence.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("io error reading {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{
        CURRENT_RECEIPT_VERSION, Decision, DecisionSource, EngineMode, Handoff, HandoffMeta,
        HandoffStatus, StepStatus, TokenUsage,
    };

    fn receipt(step_id: &str) -> Receipt {
        Receipt {
            schema_version: CURRENT_RECEIPT_VERSION.to_string(),
            run_id: "run-1".to_string(),
            flow_key: "build".to_string(),
            step_id: step_id.to_string(),
            agent_key: "implementer".to_string(),
            engine: "stub".to_string(),
            mode: EngineMode::Stub,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 1,
            status: StepStatus::Succeeded,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            exit_code: None,
            commit_sha: "deadbeef".to_string(),
            evidence: vec![],
            ac_ids: vec![],
            budget_overflow: vec![],
            timeout_event: None,
        }
    }

    fn handoff(step_id: &str) -> Handoff {
        Handoff::minimal(
            HandoffMeta {
                step_id: step_id.to_string(),
                agent_key: "implementer".to_string(),
                flow_key: "build".to_string(),
            },
            HandoffStatus::Verified,
            "implemented the change",
        )
    }

    #[test]
    fn write_receipt_commits_once_and_refuses_overwrite() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        ledger.write_receipt(&receipt("implement")).expect("commit");
        let err = ledger.write_receipt(&receipt("implement")).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCommitted { .. }));

        let read = ledger
            .read_receipt("run-1", "build", "implement", "implementer")
            .expect("read")
            .expect("present");
        assert_eq!(read.step_id, "implement");
    }

    #[test]
    fn write_handoff_refuses_overwrite_too() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        ledger.write_handoff("run-1", &handoff("implement")).expect("commit");
        let err = ledger.write_handoff("run-1", &handoff("implement")).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCommitted { .. }));
    }

    #[test]
    fn persisted_strings_are_redacted() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        let mut r = receipt("leak");
        r.commit_sha = "ok".to_string();
        r.ac_ids = vec!["token sk-ant-api03-abcdef012345".to_string()];
        ledger.write_receipt(&r).expect("commit");

        let raw = fs::read_to_string(ledger.receipt_path("run-1", "build", "leak", "implementer"))
            .expect("read raw");
        assert!(!raw.contains("sk-ant-"));
        assert!(raw.contains(conductor_redact::REDACTED));
    }

    #[test]
    fn list_receipts_orders_by_commit_and_quarantines_corruption() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        let mut first = receipt("alpha");
        first.completed_at = Utc::now();
        ledger.write_receipt(&first).expect("commit");

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut second = receipt("beta");
        second.completed_at = Utc::now();
        ledger.write_receipt(&second).expect("commit");

        // Plant a corrupt receipt.
        let corrupt = ledger.receipt_path("run-1", "build", "gamma", "implementer");
        fs::create_dir_all(corrupt.parent().unwrap()).expect("mkdir");
        fs::write(&corrupt, "{not json").expect("write");

        let listing = ledger.list_receipts("run-1", "build").expect("list");
        assert_eq!(listing.receipts.len(), 2);
        assert_eq!(listing.receipts[0].step_id, "alpha");
        assert_eq!(listing.receipts[1].step_id, "beta");
        assert_eq!(listing.quarantined.len(), 1);
        assert!(!corrupt.exists());

        let quarantine_dir = td.path().join("run-1").join("build").join("quarantine");
        assert_eq!(fs::read_dir(quarantine_dir).expect("dir").count(), 1);
    }

    #[test]
    fn read_last_checkpoint_returns_latest_step() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        assert!(ledger.read_last_checkpoint("run-1", "build").expect("read").is_none());

        ledger.write_receipt(&receipt("alpha")).expect("commit");
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger.write_receipt(&receipt("beta")).expect("commit");

        assert_eq!(
            ledger.read_last_checkpoint("run-1", "build").expect("read"),
            Some("beta".to_string())
        );
    }

    #[test]
    fn routing_and_scent_appends_preserve_order() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        for (i, decision) in [Decision::Continue, Decision::Loop, Decision::Continue]
            .iter()
            .enumerate()
        {
            ledger
                .append_routing(
                    "run-1",
                    "build",
                    &RoutingRecord {
                        from_step: format!("step-{i}"),
                        to_step: None,
                        decision: *decision,
                        source: DecisionSource::FastPath,
                        reason: "test".to_string(),
                        inputs_hash: "abc".to_string(),
                        at: Utc::now(),
                    },
                )
                .expect("append");
            ledger
                .append_scent(
                    "run-1",
                    "build",
                    &ScentEntry {
                        step: format!("step-{i}"),
                        decision: *decision,
                        rationale: "test".to_string(),
                        confidence: 1.0,
                        at: Utc::now(),
                    },
                )
                .expect("append");
        }

        let decisions = ledger.routing_decisions("run-1", "build").expect("read");
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[1].decision, Decision::Loop);

        let trail = ledger.scent_trail("run-1", "build").expect("read");
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].step, "step-0");
        assert_eq!(trail[2].step, "step-2");
    }

    #[test]
    fn retire_incomplete_receipt_moves_to_quarantine() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        ledger.write_receipt(&receipt("implement")).expect("commit");
        let retired = ledger
            .retire_incomplete_receipt("run-1", "build", "implement", "implementer")
            .expect("retire")
            .expect("was present");
        assert!(retired.exists());
        assert!(!ledger.has_receipt("run-1", "build", "implement", "implementer"));

        // A fresh commit is accepted afterwards.
        ledger.write_receipt(&receipt("implement")).expect("recommit");
    }

    #[test]
    fn escalations_fold_to_latest_entry() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        let escalation = Escalation {
            key: "esc-1".to_string(),
            flow_key: "build".to_string(),
            step_id: "implement".to_string(),
            reason: "breaker escalation".to_string(),
            raised_at: Utc::now(),
            resolution: None,
        };
        ledger.append_escalation("run-1", &escalation).expect("raise");

        let open = ledger.escalations("run-1").expect("list");
        assert_eq!(open.len(), 1);
        assert!(open[0].resolution.is_none());

        ledger
            .resolve_escalation(
                "run-1",
                "esc-1",
                EscalationResolution {
                    decision: Decision::Continue,
                    at: Utc::now(),
                    note: "operator approved".to_string(),
                },
            )
            .expect("resolve");

        let folded = ledger.escalations("run-1").expect("list");
        assert_eq!(folded.len(), 1);
        assert_eq!(
            folded[0].resolution.as_ref().map(|r| r.decision),
            Some(Decision::Continue)
        );

        // Double resolution is refused.
        assert!(
            ledger
                .resolve_escalation(
                    "run-1",
                    "esc-1",
                    EscalationResolution {
                        decision: Decision::Terminate,
                        at: Utc::now(),
                        note: String::new(),
                    },
                )
                .is_err()
        );
    }

    #[test]
    fn forensics_snapshot_writes_incident_dir() {
        let td = tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path());

        let path = ledger
            .forensics_snapshot(
                "run-1",
                "gate",
                "secret-block",
                &serde_json::json!({"cause": "secret detected"}),
            )
            .expect("snapshot");
        assert!(path.exists());
        let content = fs::read_to_string(path).expect("read");
        assert!(content.contains("secret-block"));
    }
}


#[cfg(test)]
pub(crate) mod tests_support {
    use chrono::Utc;

    use crate::types::{CURRENT_RECEIPT_VERSION, EngineMode, Receipt, StepStatus, TokenUsage};

    pub fn sample_receipt(step_id: &str) -> Receipt {
        Receipt {
            schema_version: CURRENT_RECEIPT_VERSION.to_string(),
            run_id: "run-1".to_string(),
            flow_key: "build".to_string(),
            step_id: step_id.to_string(),
            agent_key: "implementer".to_string(),
            engine: "stub".to_string(),
            mode: EngineMode::Stub,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 1,
            status: StepStatus::Succeeded,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            exit_code: None,
            commit_sha: "deadbeef".to_string(),
            evidence: vec![],
            ac_ids: vec![],
            budget_overflow: vec![],
            timeout_event: None,
        }
    }
}
