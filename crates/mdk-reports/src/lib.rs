//! Report lifecycle state machine.
//!
//! # Design
//!
//! A diagnostic report version moves through exactly one transition:
//!
//! ```text
//!    new version      finalize
//!    ───────────► DRAFT ──────► FINALIZED (terminal)
//! ```
//!
//! Every mutation that depends on report state calls one of the `check_*`
//! gates here BEFORE writing, and the storage layer runs the same check
//! inside the transaction that performs the write (the `reports` row is
//! locked first, so two requests racing the DRAFT check serialize and the
//! loser re-observes state). Illegal operations return [`LifecycleError`];
//! the gates never mutate anything themselves.
//!
//! Two different keys drive the gates:
//!
//! - the CURRENT version's [`ReportStatus`] governs result edits,
//!   finalization and amendment;
//! - the report's first-finalization timestamp (sticky) governs test-order
//!   add/remove: once a report has ever been finalized the bill is closed
//!   and orders are locked, even while an amendment version is open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ReportStatus
// ---------------------------------------------------------------------------

/// Status of one report version. Stored as text with a CHECK constraint;
/// `as_str`/`parse` define the only accepted spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Draft,
    Finalized,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "DRAFT",
            ReportStatus::Finalized => "FINALIZED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LifecycleError> {
        match s {
            "DRAFT" => Ok(ReportStatus::Draft),
            "FINALIZED" => Ok(ReportStatus::Finalized),
            other => Err(LifecycleError::UnknownStatus {
                status: other.to_string(),
            }),
        }
    }

    /// FINALIZED is terminal; nothing transitions out of it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Finalized)
    }
}

// ---------------------------------------------------------------------------
// LifecycleError
// ---------------------------------------------------------------------------

/// Gate failures. Each variant maps to exactly one stable API error code so
/// callers can branch deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Finalize called on an already-FINALIZED version. Finalization is a
    /// single deliberate act; repeats are errors, never silent successes.
    AlreadyFinalized,
    /// A gated mutation (test add/remove, result edit, direct row update)
    /// was attempted against a finalized report.
    ReportFinalized,
    /// Removing this test order would leave the visit with zero orders.
    LastTest { remaining: i64 },
    /// Amendment requested while the current version is still DRAFT.
    DraftOpen { version_num: i32 },
    /// Stored status text is outside the closed enum (data corruption; the
    /// DB CHECK constraint should have rejected it).
    UnknownStatus { status: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::AlreadyFinalized => {
                write!(f, "report version is already finalized")
            }
            LifecycleError::ReportFinalized => {
                write!(f, "report is finalized; no further mutation is allowed")
            }
            LifecycleError::LastTest { remaining } => write!(
                f,
                "a visit must keep at least one test order (currently {remaining})"
            ),
            LifecycleError::DraftOpen { version_num } => write!(
                f,
                "version {version_num} is still DRAFT; finalize it before amending"
            ),
            LifecycleError::UnknownStatus { status } => {
                write!(f, "unknown report status {status:?}")
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Finalize is legal only from DRAFT.
pub fn check_finalize(current: ReportStatus) -> Result<(), LifecycleError> {
    match current {
        ReportStatus::Draft => Ok(()),
        ReportStatus::Finalized => Err(LifecycleError::AlreadyFinalized),
    }
}

/// Test-order add/remove gate: blocked once the report has EVER been
/// finalized. Keyed on the report's sticky first-finalization timestamp,
/// not the current version's status.
pub fn check_test_mutation(finalized_at: Option<DateTime<Utc>>) -> Result<(), LifecycleError> {
    match finalized_at {
        None => Ok(()),
        Some(_) => Err(LifecycleError::ReportFinalized),
    }
}

/// Result edits apply to the current version and require it to be DRAFT.
pub fn check_result_edit(current: ReportStatus) -> Result<(), LifecycleError> {
    match current {
        ReportStatus::Draft => Ok(()),
        ReportStatus::Finalized => Err(LifecycleError::ReportFinalized),
    }
}

/// Removing a test order: finalization gate first, then the last-test rule.
/// The two failures are distinct errors: callers surface the first as a
/// conflict and the second as a validation problem.
pub fn check_remove_test(
    finalized_at: Option<DateTime<Utc>>,
    order_count: i64,
) -> Result<(), LifecycleError> {
    check_test_mutation(finalized_at)?;
    if order_count <= 1 {
        return Err(LifecycleError::LastTest {
            remaining: order_count,
        });
    }
    Ok(())
}

/// An amendment version may open only over a FINALIZED current version.
pub fn check_open_amendment(current: ReportStatus, version_num: i32) -> Result<(), LifecycleError> {
    match current {
        ReportStatus::Finalized => Ok(()),
        ReportStatus::Draft => Err(LifecycleError::DraftOpen { version_num }),
    }
}

/// Version numbers are strictly increasing per report, starting at 1.
pub fn next_version_num(current: i32) -> i32 {
    debug_assert!(current >= 1, "reports always have at least version 1");
    current + 1
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
