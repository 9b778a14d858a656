//! Error classification for the reliability engine and routing.
//!
//! Raw failures from backends and skills are mapped into four categories
//! with a strict aggregation precedence: FATAL > PERMANENT > RETRIABLE >
//! TRANSIENT. Every classified failure carries a stable signature so
//! repeated failures can be recognized for detours.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of a classified failure, ordered by escalating severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network/timeout/rate-limit/5xx family. Retried with backoff.
    Transient,
    /// Known-flaky signature. Retried without backoff.
    Retriable,
    /// Validation, missing input, 4xx. Fail fast.
    Permanent,
    /// Secrets, boundary or integrity violations. Halt the run.
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Retriable => "retriable",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

/// A raw failure as observed at a component boundary.
#[derive(Debug, Clone, Default)]
pub struct RawFailure {
    pub message: String,
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    /// Server-supplied retry hint (from `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl RawFailure {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            ..Self::default()
        }
    }

    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            http_status: Some(status),
            ..Self::default()
        }
    }
}

/// A classified failure with its derived signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classified {
    pub category: ErrorCategory,
    pub message: String,
    /// Stable identifier for this failure class.
    pub signature: String,
    /// Carried through for rate-limited transients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Classified {
    pub fn fatal(message: impl Into<String>) -> Self {
        let message = message.into();
        let signature = derive_signature("fatal", &message);
        Self {
            category: ErrorCategory::Fatal,
            message,
            signature,
            retry_after_ms: None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

// Transient: backpressure and transport failures.
const TRANSIENT_PATTERNS: &[&str] = &[
    "too many requests",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "dns",
    "tls",
    "temporarily unavailable",
    "service unavailable",
    "failed to send",
    "server error",
    "io error",
];

// Permanent: validation and contract failures.
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid",
    "validation failed",
    "missing required",
    "unknown identifier",
    "unknown step",
    "unknown agent",
    "unknown flow",
    "not found",
    "no such file",
    "unauthorized",
    "forbidden",
    "permission denied",
    "malformed",
];

// Fatal: governance and integrity markers stamped by kernel components.
const FATAL_PATTERNS: &[&str] = &[
    "secret detected",
    "boundary violation",
    "data integrity",
    "integrity failure",
    "invariant broken",
    "ledger corruption",
];

/// Classify one raw failure.
pub fn classify(raw: &RawFailure) -> Classified {
    let hay = raw.message.to_lowercase();

    let category = if FATAL_PATTERNS.iter().any(|p| hay.contains(p)) {
        ErrorCategory::Fatal
    } else if let Some(status) = raw.http_status {
        match status {
            429 => ErrorCategory::Transient,
            500..=599 => ErrorCategory::Transient,
            400..=499 => ErrorCategory::Permanent,
            _ => classify_by_message(&hay),
        }
    } else {
        classify_by_message(&hay)
    };

    let retry_after_ms = match category {
        ErrorCategory::Transient => raw.retry_after.map(|d| d.as_millis() as u64),
        _ => None,
    };

    Classified {
        signature: derive_signature(category.as_str(), &raw.message),
        category,
        message: raw.message.clone(),
        retry_after_ms,
    }
}

fn classify_by_message(hay: &str) -> ErrorCategory {
    if TRANSIENT_PATTERNS.iter().any(|p| hay.contains(p)) {
        ErrorCategory::Transient
    } else if PERMANENT_PATTERNS.iter().any(|p| hay.contains(p)) {
        ErrorCategory::Permanent
    } else {
        // Unrecognized failures retry a bounded number of times rather than
        // failing fast on the first occurrence.
        ErrorCategory::Retriable
    }
}

/// Derive a stable signature for a failure class.
///
/// The message is normalized (lowercased, digit runs collapsed) so the same
/// failure with different line numbers or counts maps to one signature.
pub fn derive_signature(scope: &str, message: &str) -> String {
    let mut normalized = String::with_capacity(message.len().min(160));
    let mut in_digits = false;
    for c in message.chars().take(160) {
        if c.is_ascii_digit() {
            if !in_digits {
                normalized.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            normalized.push(c.to_ascii_lowercase());
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Result of aggregating several coexisting failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregated {
    pub category: ErrorCategory,
    pub message: String,
    /// All signatures at the winning category.
    pub signatures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Aggregate coexisting failures by precedence.
///
/// Fatal picks the first fatal and stops looking. Permanent merges all
/// permanent messages. Retriable collects signatures. Transient keeps the
/// longest backoff hint.
pub fn aggregate(errors: &[Classified]) -> Option<Aggregated> {
    if errors.is_empty() {
        return None;
    }

    if let Some(fatal) = errors.iter().find(|e| e.category == ErrorCategory::Fatal) {
        return Some(Aggregated {
            category: ErrorCategory::Fatal,
            message: fatal.message.clone(),
            signatures: vec![fatal.signature.clone()],
            retry_after_ms: None,
        });
    }

    let winning = errors
        .iter()
        .map(|e| e.category)
        .max()
        .expect("non-empty error list");

    let at_winning: Vec<&Classified> = errors
        .iter()
        .filter(|e| e.category == winning)
        .collect();

    let message = at_winning
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    let retry_after_ms = match winning {
        ErrorCategory::Transient => at_winning.iter().filter_map(|e| e.retry_after_ms).max(),
        _ => None,
    };

    Some(Aggregated {
        category: winning,
        message,
        signatures: at_winning.iter().map(|e| e.signature.clone()).collect(),
        retry_after_ms,
    })
}

/// Rolling per-step signature counts, used to spot repeated failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureTracker {
    counts: BTreeMap<String, u32>,
}

impl SignatureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence and return the updated count.
    pub fn record(&mut self, signature: &str) -> u32 {
        let count = self.counts.entry(signature.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, signature: &str) -> u32 {
        self.counts.get(signature).copied().unwrap_or(0)
    }

    /// Signatures seen at least `threshold` times.
    pub fn repeated(&self, threshold: u32) -> Vec<String> {
        self.counts
            .iter()
            .filter(|(_, c)| **c >= threshold)
            .map(|(s, _)| s.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_families_classify_as_expected() {
        assert_eq!(
            classify(&RawFailure::http(429, "too many requests")).category,
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&RawFailure::http(503, "service unavailable")).category,
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&RawFailure::http(404, "not found")).category,
            ErrorCategory::Permanent
        );
        assert_eq!(
            classify(&RawFailure::http(400, "bad request")).category,
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn message_patterns_classify_without_status() {
        assert_eq!(
            classify(&RawFailure::message("connection reset by peer")).category,
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&RawFailure::message("missing required input: diff")).category,
            ErrorCategory::Permanent
        );
        assert_eq!(
            classify(&RawFailure::message("secret detected in step output")).category,
            ErrorCategory::Fatal
        );
        assert_eq!(
            classify(&RawFailure::message("some unexplained flake")).category,
            ErrorCategory::Retriable
        );
    }

    #[test]
    fn fatal_markers_win_over_status() {
        let raw = RawFailure {
            message: "boundary violation: force push outside sandbox".to_string(),
            http_status: Some(503),
            ..RawFailure::default()
        };
        assert_eq!(classify(&raw).category, ErrorCategory::Fatal);
    }

    #[test]
    fn retry_after_survives_only_for_transient() {
        let raw = RawFailure {
            message: "too many requests".to_string(),
            http_status: Some(429),
            retry_after: Some(Duration::from_secs(2)),
            ..RawFailure::default()
        };
        let classified = classify(&raw);
        assert_eq!(classified.retry_after(), Some(Duration::from_secs(2)));

        let permanent = RawFailure {
            message: "forbidden".to_string(),
            http_status: Some(403),
            retry_after: Some(Duration::from_secs(2)),
            ..RawFailure::default()
        };
        assert!(classify(&permanent).retry_after().is_none());
    }

    #[test]
    fn signatures_are_stable_across_numeric_noise() {
        let a = classify(&RawFailure::message("lint: unused variable at line 42"));
        let b = classify(&RawFailure::message("lint: unused variable at line 137"));
        assert_eq!(a.signature, b.signature);

        let c = classify(&RawFailure::message("lint: missing semicolon"));
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn aggregate_follows_precedence() {
        let errors = vec![
            classify(&RawFailure::message("timed out waiting for backend")),
            classify(&RawFailure::message("missing required input: spec")),
            classify(&RawFailure::message("another flake")),
        ];
        let agg = aggregate(&errors).expect("non-empty");
        assert_eq!(agg.category, ErrorCategory::Permanent);
        assert!(agg.message.contains("missing required input"));
        assert!(!agg.message.contains("timed out"));
    }

    #[test]
    fn aggregate_fatal_short_circuits() {
        let errors = vec![
            classify(&RawFailure::message("timed out")),
            Classified::fatal("invariant broken: duplicate receipt"),
            Classified::fatal("secret detected"),
        ];
        let agg = aggregate(&errors).expect("non-empty");
        assert_eq!(agg.category, ErrorCategory::Fatal);
        assert_eq!(agg.signatures.len(), 1);
        assert!(agg.message.contains("invariant broken"));
    }

    #[test]
    fn aggregate_transient_keeps_longest_backoff() {
        let mut a = classify(&RawFailure::http(429, "too many requests"));
        a.retry_after_ms = Some(2000);
        let mut b = classify(&RawFailure::http(503, "service unavailable"));
        b.retry_after_ms = Some(5000);
        let agg = aggregate(&[a, b]).expect("non-empty");
        assert_eq!(agg.category, ErrorCategory::Transient);
        assert_eq!(agg.retry_after_ms, Some(5000));
    }

    #[test]
    fn aggregate_empty_is_none() {
        assert!(aggregate(&[]).is_none());
    }

    #[test]
    fn signature_tracker_counts_repeats() {
        let mut tracker = SignatureTracker::new();
        assert_eq!(tracker.record("sig-a"), 1);
        assert_eq!(tracker.record("sig-a"), 2);
        assert_eq!(tracker.record("sig-b"), 1);
        assert_eq!(tracker.count("sig-a"), 2);
        assert_eq!(tracker.repeated(2), vec!["sig-a".to_string()]);
    }
}
