//! Schema version parsing, validation, and receipt migration.
//!
//! Persisted entities carry a `schema_version` string shaped
//! `conductor.<entity>.v<N>`. Readers accept the current version and one
//! major behind it; older versions are rejected with a clear error.

use std::path::Path;

use anyhow::{Context, Result};

use crate::types::{CURRENT_RECEIPT_VERSION, MINIMUM_SUPPORTED_RECEIPT_VERSION, Receipt};

/// Parse the numeric version from a string like `conductor.receipt.v2`.
pub fn parse_schema_version(version: &str) -> Result<u32> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts[0] != "conductor" || !parts[2].starts_with('v') {
        anyhow::bail!("invalid schema version format: {}", version);
    }

    let version_part = &parts[2][1..];
    version_part
        .parse::<u32>()
        .with_context(|| format!("invalid version number in schema version: {}", version))
}

/// Validate a receipt schema version against the supported window.
pub fn validate_receipt_version(version: &str) -> Result<()> {
    let version_num = parse_schema_version(version)
        .with_context(|| format!("invalid receipt version format: {}", version))?;

    let minimum_num = parse_schema_version(MINIMUM_SUPPORTED_RECEIPT_VERSION)
        .context("invalid minimum receipt version")?;
    let current_num =
        parse_schema_version(CURRENT_RECEIPT_VERSION).context("invalid current receipt version")?;

    if version_num < minimum_num {
        anyhow::bail!(
            "receipt version {} is too old; minimum supported version is {}",
            version,
            MINIMUM_SUPPORTED_RECEIPT_VERSION
        );
    }
    if version_num > current_num {
        anyhow::bail!(
            "receipt version {} is newer than this kernel supports ({})",
            version,
            CURRENT_RECEIPT_VERSION
        );
    }

    Ok(())
}

/// Read a receipt from disk, migrating older supported versions forward.
pub fn read_receipt_migrating(path: &Path) -> Result<Receipt> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read receipt file {}", path.display()))?;
    parse_receipt_migrating(&content)
        .with_context(|| format!("failed to load receipt {}", path.display()))
}

/// Parse receipt JSON, applying migrations based on its declared version.
pub fn parse_receipt_migrating(content: &str) -> Result<Receipt> {
    let value: serde_json::Value =
        serde_json::from_str(content).context("failed to parse receipt JSON")?;

    let receipt_version = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or(MINIMUM_SUPPORTED_RECEIPT_VERSION)
        .to_string();

    validate_receipt_version(&receipt_version)?;

    let receipt = match receipt_version.as_str() {
        "conductor.receipt.v1" => migrate_v1_to_v2(value)?,
        _ => serde_json::from_value(value).context("failed to deserialize receipt")?,
    };

    Ok(receipt)
}

/// v1 receipts predate packer overflow accounting and timeout events.
fn migrate_v1_to_v2(mut receipt: serde_json::Value) -> Result<Receipt> {
    if receipt.get("budget_overflow").is_none() {
        receipt["budget_overflow"] = serde_json::Value::Array(vec![]);
    }
    if receipt.get("timeout_event").is_none() {
        receipt["timeout_event"] = serde_json::Value::Null;
    }
    receipt["schema_version"] = serde_json::Value::String(CURRENT_RECEIPT_VERSION.to_string());

    serde_json::from_value(receipt).context("failed to deserialize migrated v1 receipt")
}
