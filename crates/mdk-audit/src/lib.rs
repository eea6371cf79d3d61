//! Audit trail export and verification.
//!
//! The authoritative audit trail lives in the `audit_log` table, which is
//! insert-only (UPDATE/DELETE rejected by trigger). This crate handles the
//! portable side: exporting rows as a hash-chained JSON Lines file and
//! verifying an exported file offline. Each exported record carries
//! `hash_prev` (the previous record's hash) and `hash_self`, so any edit,
//! reorder or deletion after export is detectable without DB access.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Action name spellings shared by the storage layer, the exporter and
/// tests. One string per audited operation.
pub mod actions {
    pub const PATIENT_CREATE: &str = "patient.create";
    pub const VISIT_CREATE: &str = "visit.create";
    pub const VISIT_ADD_TESTS: &str = "visit.add_tests";
    pub const VISIT_REMOVE_TEST: &str = "visit.remove_test";
    pub const REPORT_SAVE_RESULTS: &str = "report.save_results";
    pub const REPORT_FINALIZE: &str = "report.finalize";
    pub const REPORT_AMEND: &str = "report.amend";
    pub const CATALOG_UPSERT: &str = "catalog.upsert";
    pub const CATALOG_PRICE_SET: &str = "catalog.set_price";
    pub const CATALOG_IMPORT: &str = "catalog.import";
}

/// One audit record as exported. Mirrors an `audit_log` row; `seq` is the
/// row's bigserial id, which fixes the export order. `hash_prev`/`hash_self`
/// exist only in the export, not in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub branch_code: String,
    pub actor: String,
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub detail: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only chain writer. Records must arrive in `seq` order; each
/// appended line links to the previous via `hash_prev`.
pub struct ChainWriter {
    path: PathBuf,
    last_hash: Option<String>,
}

impl ChainWriter {
    /// Creates the writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self {
            path,
            last_hash: None,
        })
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    /// Append one record: fills `hash_prev` from chain state, computes
    /// `hash_self`, writes one canonical JSON line.
    pub fn append(&mut self, mut record: AuditRecord) -> Result<AuditRecord> {
        record.hash_prev = self.last_hash.clone();
        record.hash_self = None;

        let self_hash = compute_record_hash(&record)?;
        record.hash_self = Some(self_hash.clone());
        self.last_hash = Some(self_hash);

        let line = canonical_json_line(&record)?;
        append_line(&self.path, &line)?;

        Ok(record)
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit export {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
/// One record == one JSON line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit record failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash is computed over canonical JSON of the record WITHOUT hash_self
/// (to avoid self-reference). hash_prev IS included, which is what makes
/// reordering detectable.
pub fn compute_record_hash(record: &AuditRecord) -> Result<String> {
    let mut clone = record.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Verify the hash chain integrity of an exported audit file.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit export {:?}", path.as_ref()))?;
    verify_chain_str(&content)
}

/// Same logic as [`verify_chain`] but operates on an in-memory `&str`.
pub fn verify_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: AuditRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit record at line {}", i + 1))?;

        line_count += 1;

        // 1. hash_prev must match the previous record's hash_self
        if record.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, record.hash_prev
                ),
            });
        }

        // 2. hash_self must be correct for this record's content
        if let Some(ref claimed_hash) = record.hash_self {
            let recomputed = compute_record_hash(&record)?;
            if *claimed_hash != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!(
                        "hash_self mismatch: claimed {}, recomputed {}",
                        claimed_hash, recomputed
                    ),
                });
            }
        }

        prev_hash = record.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Result of chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The entire chain is valid.
    Valid { lines: usize },
    /// The chain is broken at the given line.
    Broken { line: usize, reason: String },
}
