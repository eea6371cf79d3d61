//! Report lifecycle operations: result entry, finalization, amendment.
//!
//! Every mutation locks the visit's `reports` row first, re-reads the
//! current version's status under that lock, and re-checks the lifecycle
//! gate before writing. Two finalize calls racing on one report serialize
//! on the row lock; the loser re-observes FINALIZED and gets
//! `AlreadyFinalized` instead of a double transition.

use crate::{insert_audit_tx, lock_report_for_visit, LockedReport, NewAuditRow, StoreError};
use mdk_billing::BranchCode;
use mdk_reports::{
    check_finalize, check_open_amendment, check_result_edit, next_version_num, ReportStatus,
};
use mdk_schemas::{ReportVersionView, ReportView};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Overwrite the CURRENT version's results. The payload must be a JSON
/// object; per-test keys are free-form and owned by the reporting staff.
pub async fn save_results(
    pool: &PgPool,
    visit_id: Uuid,
    branch: &BranchCode,
    results: &serde_json::Value,
    actor: &str,
) -> Result<ReportView, StoreError> {
    if !results.is_object() {
        return Err(StoreError::Validation {
            message: "results must be a JSON object keyed by test code".into(),
        });
    }

    let mut tx = pool.begin().await?;

    let report = lock_report_for_visit(&mut tx, visit_id, branch).await?;
    let status = current_version_status(&mut tx, &report).await?;
    check_result_edit(status)?;

    sqlx::query(
        r#"
        update report_versions
        set results = $3
        where report_id = $1
          and version_num = $2
        "#,
    )
    .bind(report.report_id)
    .bind(report.current_version)
    .bind(results)
    .execute(&mut *tx)
    .await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: branch.as_str(),
            actor,
            action: mdk_audit::actions::REPORT_SAVE_RESULTS,
            entity: "report",
            entity_id: report.report_id.to_string(),
            detail: serde_json::json!({
                "visit_id": visit_id,
                "version_num": report.current_version,
                "result_keys": results.as_object().map(|m| m.len()).unwrap_or(0),
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_report(pool, visit_id, Some(branch)).await
}

/// One-way DRAFT -> FINALIZED transition for the current version. The
/// report-level `finalized_at` is set at the FIRST finalization only and
/// stays put across amendments; it is what locks the test orders.
pub async fn finalize_report(
    pool: &PgPool,
    visit_id: Uuid,
    branch: &BranchCode,
    actor: &str,
) -> Result<ReportView, StoreError> {
    let mut tx = pool.begin().await?;

    let report = lock_report_for_visit(&mut tx, visit_id, branch).await?;
    let status = current_version_status(&mut tx, &report).await?;
    check_finalize(status)?;

    sqlx::query(
        r#"
        update report_versions
        set status = 'FINALIZED',
            finalized_at = now(),
            finalized_by = $3
        where report_id = $1
          and version_num = $2
          and status = 'DRAFT'
        "#,
    )
    .bind(report.report_id)
    .bind(report.current_version)
    .bind(actor)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        update reports
        set finalized_at = coalesce(finalized_at, now())
        where report_id = $1
        "#,
    )
    .bind(report.report_id)
    .execute(&mut *tx)
    .await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: branch.as_str(),
            actor,
            action: mdk_audit::actions::REPORT_FINALIZE,
            entity: "report",
            entity_id: report.report_id.to_string(),
            detail: serde_json::json!({
                "visit_id": visit_id,
                "version_num": report.current_version,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_report(pool, visit_id, Some(branch)).await
}

/// Open version N+1 as a new DRAFT over a FINALIZED report, carrying the
/// finalized results forward as the editing baseline. Earlier versions
/// stay frozen and readable.
pub async fn open_amendment(
    pool: &PgPool,
    visit_id: Uuid,
    branch: &BranchCode,
    actor: &str,
) -> Result<ReportView, StoreError> {
    let mut tx = pool.begin().await?;

    let report = lock_report_for_visit(&mut tx, visit_id, branch).await?;
    let status = current_version_status(&mut tx, &report).await?;
    check_open_amendment(status, report.current_version)?;

    let next = next_version_num(report.current_version);
    sqlx::query(
        r#"
        insert into report_versions (report_version_id, report_id, version_num, status, results)
        select $1, report_id, $2, 'DRAFT', results
        from report_versions
        where report_id = $3
          and version_num = $4
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(next)
    .bind(report.report_id)
    .bind(report.current_version)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        update reports
        set current_version = $2
        where report_id = $1
        "#,
    )
    .bind(report.report_id)
    .bind(next)
    .execute(&mut *tx)
    .await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: branch.as_str(),
            actor,
            action: mdk_audit::actions::REPORT_AMEND,
            entity: "report",
            entity_id: report.report_id.to_string(),
            detail: serde_json::json!({
                "visit_id": visit_id,
                "from_version": report.current_version,
                "to_version": next,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_report(pool, visit_id, Some(branch)).await
}

/// Read the full report: header plus every version in order, from one
/// snapshot. `branch = Some(..)` scopes the lookup to that branch.
pub async fn fetch_report(
    pool: &PgPool,
    visit_id: Uuid,
    branch: Option<&BranchCode>,
) -> Result<ReportView, StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("set transaction isolation level repeatable read")
        .execute(&mut *tx)
        .await?;

    let head = sqlx::query(
        r#"
        select r.report_id, r.visit_id, r.current_version, r.finalized_at
        from reports r
        join visits v on v.visit_id = r.visit_id
        where r.visit_id = $1
          and ($2::text is null or v.branch_code = $2)
        "#,
    )
    .bind(visit_id)
    .bind(branch.map(|b| b.as_str()))
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound { entity: "visit" })?;

    let report_id: Uuid = head.try_get("report_id").map_err(StoreError::Db)?;

    let version_rows = sqlx::query(
        r#"
        select version_num, status, results, finalized_at, finalized_by, created_at
        from report_versions
        where report_id = $1
        order by version_num asc
        "#,
    )
    .bind(report_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut versions = Vec::with_capacity(version_rows.len());
    for r in version_rows {
        versions.push(ReportVersionView {
            version_num: r.try_get("version_num").map_err(StoreError::Db)?,
            status: r.try_get("status").map_err(StoreError::Db)?,
            results: r.try_get("results").map_err(StoreError::Db)?,
            finalized_at: r.try_get("finalized_at").map_err(StoreError::Db)?,
            finalized_by: r.try_get("finalized_by").map_err(StoreError::Db)?,
            created_at: r.try_get("created_at").map_err(StoreError::Db)?,
        });
    }

    Ok(ReportView {
        report_id,
        visit_id: head.try_get("visit_id").map_err(StoreError::Db)?,
        current_version: head.try_get("current_version").map_err(StoreError::Db)?,
        finalized_at: head.try_get("finalized_at").map_err(StoreError::Db)?,
        versions,
    })
}

/// Status of the CURRENT version, read under the caller's row lock.
async fn current_version_status(
    tx: &mut Transaction<'_, Postgres>,
    report: &LockedReport,
) -> Result<ReportStatus, StoreError> {
    let status: String = sqlx::query_scalar(
        r#"
        select status
        from report_versions
        where report_id = $1
          and version_num = $2
        "#,
    )
    .bind(report.report_id)
    .bind(report.current_version)
    .fetch_one(&mut **tx)
    .await?;

    Ok(ReportStatus::parse(&status)?)
}
