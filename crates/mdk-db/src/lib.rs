//! Postgres storage layer: bill-number allocation, visit assembly, report
//! lifecycle writes and the append-only audit log.
//!
//! Every state-changing operation follows the same shape: open a
//! transaction, lock the visit's `reports` row with `FOR UPDATE` (the single
//! serialization point for one visit), re-check lifecycle gates on the
//! locked state, write, append the audit row, commit. Bill-number
//! allocation is the one deliberate exception: it commits on its own BEFORE
//! the visit transaction, so a rollback leaves a gap in the sequence rather
//! than ever reusing a number.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mdk_billing::BranchCode;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::fmt;

mod registry;
mod reports;
mod sequence;
mod visits;

pub use registry::{
    fetch_patient, import_lab_tests_csv, insert_patient, list_lab_tests, set_lab_test_price,
    upsert_lab_test, CatalogImportArgs, CatalogImportReport, CatalogRejects, NewPatient,
    UpsertLabTest,
};
pub use reports::{fetch_report, finalize_report, open_amendment, save_results};
pub use sequence::{allocate_bill_number, peek_sequence};
pub use visits::{add_tests, create_visit, fetch_visit, remove_test, NewVisit};

pub const ENV_DB_URL: &str = "MDK_DATABASE_URL";

/// Connect to Postgres using MDK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    connect_from_env_with(10).await
}

/// Connect with an explicit pool size (config-driven in the daemon).
pub async fn connect_from_env_with(max_connections: u32) -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='bills'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_bills_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_bills_table: bool,
}

/// Count issued bills. Used by CLI guardrails: re-running migrations against
/// a database that already issued bills requires explicit confirmation.
pub async fn count_bills(pool: &PgPool) -> Result<i64> {
    // If schema doesn't exist yet, treat as 0 (safe) rather than failing.
    let st = status(pool).await?;
    if !st.has_bills_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*)::bigint from bills")
        .fetch_one(pool)
        .await
        .context("count_bills failed")?;

    Ok(n)
}

/// Convenience boolean.
pub async fn has_existing_bills(pool: &PgPool) -> Result<bool> {
    Ok(count_bills(pool).await? > 0)
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Storage-level failures that callers branch on. Each variant maps to
/// exactly one stable API error code; everything else rides in `Db`.
#[derive(Debug)]
pub enum StoreError {
    /// Entity missing, or visible only from another branch.
    NotFound { entity: &'static str },
    /// Input rejected before or during the write.
    Validation { message: String },
    /// One or more requested tests are already ordered on the visit.
    DuplicateTests { codes: Vec<String> },
    /// Mutation blocked because the report has been finalized.
    ReportFinalized,
    /// Finalize called on an already-finalized version.
    AlreadyFinalized,
    /// Amendment requested while a draft version is still open.
    DraftOpen { version_num: i32 },
    /// A DB trigger rejected an in-place change to an immutable row.
    /// Application flows never update those rows, so surfacing this means
    /// a code path is broken, not that the client did anything wrong.
    Immutable,
    /// Transient serialization/lock contention outlasted the retry budget.
    Contention { attempts: u32 },
    /// Invariant breakage detected at the storage layer.
    Internal { message: String },
    /// Any other database failure.
    Db(sqlx::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { entity } => write!(f, "{entity} not found"),
            StoreError::Validation { message } => f.write_str(message),
            StoreError::DuplicateTests { codes } => {
                if codes.is_empty() {
                    write!(f, "test already ordered on this visit")
                } else {
                    write!(f, "tests already ordered on this visit: {}", codes.join(", "))
                }
            }
            StoreError::ReportFinalized => {
                write!(f, "report is finalized; no further mutation is allowed")
            }
            StoreError::AlreadyFinalized => write!(f, "report version is already finalized"),
            StoreError::DraftOpen { version_num } => write!(
                f,
                "version {version_num} is still DRAFT; finalize it before amending"
            ),
            StoreError::Immutable => write!(f, "row is immutable"),
            StoreError::Contention { attempts } => {
                write!(f, "sequence contention persisted after {attempts} attempt(s)")
            }
            StoreError::Internal { message } => f.write_str(message),
            StoreError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                // Raised by the immutability triggers.
                Some("RPTFZ") => return StoreError::ReportFinalized,
                Some("IMMUT") => return StoreError::Immutable,
                // serialization_failure / deadlock_detected / lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    return StoreError::Contention { attempts: 1 }
                }
                Some("23505") => {
                    if db.constraint() == Some("uq_test_orders_visit_test") {
                        return StoreError::DuplicateTests { codes: vec![] };
                    }
                    if db.constraint() == Some("uq_bills_branch_number") {
                        // The counter table is supposed to make this impossible.
                        return StoreError::Internal {
                            message: format!("duplicate bill number: {}", db.message()),
                        };
                    }
                }
                // check_violation / foreign_key_violation: app validation runs
                // first, so these fire only for writes that bypassed it.
                Some("23514") | Some("23503") => {
                    return StoreError::Validation {
                        message: db.message().to_string(),
                    }
                }
                _ => {}
            }
        }
        StoreError::Db(e)
    }
}

impl From<mdk_reports::LifecycleError> for StoreError {
    fn from(e: mdk_reports::LifecycleError) -> Self {
        use mdk_reports::LifecycleError;
        match e {
            LifecycleError::AlreadyFinalized => StoreError::AlreadyFinalized,
            LifecycleError::ReportFinalized => StoreError::ReportFinalized,
            LifecycleError::LastTest { .. } => StoreError::Validation {
                message: e.to_string(),
            },
            LifecycleError::DraftOpen { version_num } => StoreError::DraftOpen { version_num },
            LifecycleError::UnknownStatus { .. } => StoreError::Internal {
                message: e.to_string(),
            },
        }
    }
}

impl From<mdk_billing::BillingError> for StoreError {
    fn from(e: mdk_billing::BillingError) -> Self {
        StoreError::Validation {
            message: e.to_string(),
        }
    }
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// Transient conflicts worth a bounded retry: serialization failure,
/// deadlock, lock timeout. Constraint violations are NEVER transient.
pub(crate) fn is_transient_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Report-row locking
// ---------------------------------------------------------------------------

/// Snapshot of the locked `reports` row. Every guarded mutation starts by
/// taking this lock, so two writers racing the same visit serialize here and
/// the loser re-observes the winner's committed state.
#[derive(Debug, Clone)]
pub(crate) struct LockedReport {
    pub report_id: uuid::Uuid,
    pub current_version: i32,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Lock the report row for a visit, scoped to the caller's branch. A visit
/// that exists on another branch is indistinguishable from one that does not
/// exist at all.
pub(crate) async fn lock_report_for_visit(
    tx: &mut Transaction<'_, Postgres>,
    visit_id: uuid::Uuid,
    branch: &BranchCode,
) -> Result<LockedReport, StoreError> {
    let row = sqlx::query(
        r#"
        select r.report_id, r.current_version, r.finalized_at
        from reports r
        join visits v on v.visit_id = r.visit_id
        where r.visit_id = $1
          and v.branch_code = $2
        for update of r
        "#,
    )
    .bind(visit_id)
    .bind(branch.as_str())
    .fetch_optional(&mut **tx)
    .await?;

    let row = row.ok_or(StoreError::NotFound { entity: "visit" })?;
    Ok(LockedReport {
        report_id: row.try_get("report_id").map_err(StoreError::Db)?,
        current_version: row.try_get("current_version").map_err(StoreError::Db)?,
        finalized_at: row.try_get("finalized_at").map_err(StoreError::Db)?,
    })
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// One audit row as stored.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub audit_id: i64,
    pub at: DateTime<Utc>,
    pub branch_code: String,
    pub actor: String,
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub detail: Value,
}

#[derive(Debug, Clone)]
pub struct NewAuditRow<'a> {
    pub branch_code: &'a str,
    pub actor: &'a str,
    pub action: &'a str,
    pub entity: &'a str,
    pub entity_id: String,
    pub detail: Value,
}

/// Append an audit row inside the caller's transaction, so the trail commits
/// or rolls back together with the mutation it describes.
pub(crate) async fn insert_audit_tx(
    tx: &mut Transaction<'_, Postgres>,
    row: NewAuditRow<'_>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        insert into audit_log (branch_code, actor, action, entity, entity_id, detail)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(row.branch_code)
    .bind(row.actor)
    .bind(row.action)
    .bind(row.entity)
    .bind(&row.entity_id)
    .bind(&row.detail)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Page through the audit log in id order. Used by the CLI exporter; pass
/// the last id seen (0 to start) and a page size.
pub async fn fetch_audit_page(
    pool: &PgPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<AuditRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        select audit_id, at, branch_code, actor, action, entity, entity_id, detail
        from audit_log
        where audit_id > $1
        order by audit_id asc
        limit $2
        "#,
    )
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(AuditRow {
            audit_id: r.try_get("audit_id").map_err(StoreError::Db)?,
            at: r.try_get("at").map_err(StoreError::Db)?,
            branch_code: r.try_get("branch_code").map_err(StoreError::Db)?,
            actor: r.try_get("actor").map_err(StoreError::Db)?,
            action: r.try_get("action").map_err(StoreError::Db)?,
            entity: r.try_get("entity").map_err(StoreError::Db)?,
            entity_id: r.try_get("entity_id").map_err(StoreError::Db)?,
            detail: r.try_get("detail").map_err(StoreError::Db)?,
        });
    }
    Ok(out)
}
