//! Diagnostic visit creation and test-order mutation.
//!
//! Visit creation allocates the bill number FIRST (its own committed
//! statement), then runs one transaction for visit + bill + order snapshots
//! + report scaffold + audit row. If that transaction rolls back, the
//! allocated number is burned as a gap; the sequence never reuses it.
//!
//! Order add/remove locks the visit's report row, re-checks the
//! finalization gate on locked state, then rewrites the bill totals in the
//! same transaction so `net = subtotal - discount` holds at every commit.

use crate::{
    insert_audit_tx, lock_report_for_visit, sequence::allocate_bill_number, NewAuditRow,
    StoreError,
};
use mdk_billing::{BillTotals, BranchCode, SequenceDomain};
use mdk_config::AllocatorConfig;
use mdk_reports::check_test_mutation;
use mdk_schemas::{BillView, PatientView, ReportSummary, TestOrderView, VisitDetail};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewVisit {
    pub branch: BranchCode,
    pub patient_id: Uuid,
    pub referred_by: Option<Uuid>,
    pub test_codes: Vec<String>,
    pub discount_paise: i64,
    pub actor: String,
}

/// A catalog row snapshot taken inside the transaction that orders it.
struct CatalogSnapshot {
    lab_test_id: Uuid,
    code: String,
    name: String,
    price_in_paise: i64,
    ref_range: Option<String>,
    unit: Option<String>,
}

/// Create a diagnostic visit: bill number, bill, ordered tests (with price
/// snapshots), and a version-1 DRAFT report, atomically.
pub async fn create_visit(
    pool: &PgPool,
    policy: AllocatorConfig,
    v: &NewVisit,
) -> Result<VisitDetail, StoreError> {
    let codes = normalize_requested_codes(&v.test_codes)?;

    // Allocation is durable before the visit exists. A failure below this
    // point leaves a gap in the sequence, never a duplicate.
    let bill_number =
        allocate_bill_number(pool, &v.branch, SequenceDomain::Diagnostic, policy).await?;

    let mut tx = pool.begin().await?;

    let patient_exists: bool =
        sqlx::query_scalar("select exists (select 1 from patients where patient_id = $1)")
            .bind(v.patient_id)
            .fetch_one(&mut *tx)
            .await?;
    if !patient_exists {
        return Err(StoreError::NotFound { entity: "patient" });
    }

    if let Some(doctor_id) = v.referred_by {
        let doctor_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from referral_doctors where doctor_id = $1)",
        )
        .bind(doctor_id)
        .fetch_one(&mut *tx)
        .await?;
        if !doctor_exists {
            return Err(StoreError::Validation {
                message: format!("unknown referral doctor {doctor_id}"),
            });
        }
    }

    let snapshots = fetch_catalog_snapshots(&mut tx, &codes).await?;
    let totals = BillTotals::from_prices(
        snapshots.iter().map(|s| s.price_in_paise),
        v.discount_paise,
    )?;

    let visit_id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into visits (visit_id, branch_code, patient_id, referred_by)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(visit_id)
    .bind(v.branch.as_str())
    .bind(v.patient_id)
    .bind(v.referred_by)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into bills (
            bill_id, visit_id, branch_code, bill_number,
            subtotal_paise, discount_paise, net_paise
        ) values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(visit_id)
    .bind(v.branch.as_str())
    .bind(bill_number.to_string())
    .bind(totals.subtotal_paise)
    .bind(totals.discount_paise)
    .bind(totals.net_paise)
    .execute(&mut *tx)
    .await?;

    insert_order_snapshots(&mut tx, visit_id, &snapshots).await?;

    let report_id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into reports (report_id, visit_id, current_version)
        values ($1, $2, 1)
        "#,
    )
    .bind(report_id)
    .bind(visit_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into report_versions (report_version_id, report_id, version_num, status)
        values ($1, $2, 1, 'DRAFT')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(report_id)
    .execute(&mut *tx)
    .await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: v.branch.as_str(),
            actor: &v.actor,
            action: mdk_audit::actions::VISIT_CREATE,
            entity: "visit",
            entity_id: visit_id.to_string(),
            detail: serde_json::json!({
                "bill_number": bill_number.to_string(),
                "test_codes": codes,
                "net_paise": totals.net_paise,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_visit(pool, visit_id, Some(&v.branch)).await
}

/// Add tests to an existing visit. Blocked once the report has ever been
/// finalized; otherwise snapshots the catalog rows and rewrites the bill.
pub async fn add_tests(
    pool: &PgPool,
    visit_id: Uuid,
    branch: &BranchCode,
    test_codes: &[String],
    actor: &str,
) -> Result<VisitDetail, StoreError> {
    let codes = normalize_requested_codes(test_codes)?;

    let mut tx = pool.begin().await?;

    let report = lock_report_for_visit(&mut tx, visit_id, branch).await?;
    check_test_mutation(report.finalized_at)?;

    let snapshots = fetch_catalog_snapshots(&mut tx, &codes).await?;

    let already_ordered: Vec<String> = sqlx::query_scalar(
        r#"
        select test_code
        from test_orders
        where visit_id = $1
          and lab_test_id = any($2)
        order by test_code
        "#,
    )
    .bind(visit_id)
    .bind(snapshots.iter().map(|s| s.lab_test_id).collect::<Vec<_>>())
    .fetch_all(&mut *tx)
    .await?;
    if !already_ordered.is_empty() {
        return Err(StoreError::DuplicateTests {
            codes: already_ordered,
        });
    }

    insert_order_snapshots(&mut tx, visit_id, &snapshots).await?;
    let totals = rewrite_bill_totals(&mut tx, visit_id).await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: branch.as_str(),
            actor,
            action: mdk_audit::actions::VISIT_ADD_TESTS,
            entity: "visit",
            entity_id: visit_id.to_string(),
            detail: serde_json::json!({
                "test_codes": codes,
                "net_paise": totals.net_paise,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_visit(pool, visit_id, Some(branch)).await
}

/// Remove one ordered test. Blocked after finalization; a visit always
/// keeps at least one order.
pub async fn remove_test(
    pool: &PgPool,
    visit_id: Uuid,
    branch: &BranchCode,
    test_order_id: Uuid,
    actor: &str,
) -> Result<VisitDetail, StoreError> {
    let mut tx = pool.begin().await?;

    let report = lock_report_for_visit(&mut tx, visit_id, branch).await?;
    check_test_mutation(report.finalized_at)?;

    let removed_code: Option<String> = sqlx::query_scalar(
        r#"
        select test_code
        from test_orders
        where test_order_id = $1
          and visit_id = $2
        "#,
    )
    .bind(test_order_id)
    .bind(visit_id)
    .fetch_optional(&mut *tx)
    .await?;
    let removed_code = removed_code.ok_or(StoreError::NotFound {
        entity: "test order",
    })?;

    let order_count: i64 =
        sqlx::query_scalar("select count(*)::bigint from test_orders where visit_id = $1")
            .bind(visit_id)
            .fetch_one(&mut *tx)
            .await?;
    mdk_reports::check_remove_test(report.finalized_at, order_count)?;

    sqlx::query("delete from test_orders where test_order_id = $1")
        .bind(test_order_id)
        .execute(&mut *tx)
        .await?;

    let totals = rewrite_bill_totals(&mut tx, visit_id).await?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: branch.as_str(),
            actor,
            action: mdk_audit::actions::VISIT_REMOVE_TEST,
            entity: "visit",
            entity_id: visit_id.to_string(),
            detail: serde_json::json!({
                "test_code": removed_code,
                "net_paise": totals.net_paise,
            }),
        },
    )
    .await?;

    tx.commit().await?;

    fetch_visit(pool, visit_id, Some(branch)).await
}

/// Assemble the full visit read model in ONE snapshot: patient, bill,
/// orders and report state all observe the same committed state, so a
/// reader never sees a bill total from before an order list from after.
///
/// `branch = Some(..)` scopes the lookup: a visit owned by another branch
/// reads as not found.
pub async fn fetch_visit(
    pool: &PgPool,
    visit_id: Uuid,
    branch: Option<&BranchCode>,
) -> Result<VisitDetail, StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("set transaction isolation level repeatable read")
        .execute(&mut *tx)
        .await?;

    let head = sqlx::query(
        r#"
        select
            v.visit_id, v.branch_code, v.referred_by, v.created_at,
            p.patient_id, p.full_name, p.phone, p.sex, p.born_on,
            p.created_at as patient_created_at
        from visits v
        join patients p on p.patient_id = v.patient_id
        where v.visit_id = $1
          and ($2::text is null or v.branch_code = $2)
        "#,
    )
    .bind(visit_id)
    .bind(branch.map(|b| b.as_str()))
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound { entity: "visit" })?;

    let bill_row = sqlx::query(
        r#"
        select bill_id, branch_code, bill_number,
               subtotal_paise, discount_paise, net_paise, issued_at
        from bills
        where visit_id = $1
        "#,
    )
    .bind(visit_id)
    .fetch_one(&mut *tx)
    .await?;

    let order_rows = sqlx::query(
        r#"
        select test_order_id, lab_test_id, test_code, test_name,
               price_in_paise, ref_range, unit, ordered_at
        from test_orders
        where visit_id = $1
        order by ordered_at asc, test_code asc
        "#,
    )
    .bind(visit_id)
    .fetch_all(&mut *tx)
    .await?;

    let report_row = sqlx::query(
        r#"
        select r.report_id, r.current_version, r.finalized_at, rv.status
        from reports r
        join report_versions rv
          on rv.report_id = r.report_id
         and rv.version_num = r.current_version
        where r.visit_id = $1
        "#,
    )
    .bind(visit_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    let issued_at: chrono::DateTime<chrono::Utc> =
        bill_row.try_get("issued_at").map_err(StoreError::Db)?;
    let bill = BillView {
        id: bill_row.try_get("bill_id").map_err(StoreError::Db)?,
        branch_code: bill_row.try_get("branch_code").map_err(StoreError::Db)?,
        bill_number: bill_row.try_get("bill_number").map_err(StoreError::Db)?,
        subtotal_paise: bill_row.try_get("subtotal_paise").map_err(StoreError::Db)?,
        discount_paise: bill_row.try_get("discount_paise").map_err(StoreError::Db)?,
        net_paise: bill_row.try_get("net_paise").map_err(StoreError::Db)?,
        issued_at,
        issued_at_ist: mdk_billing::format_ist(issued_at),
    };

    let mut test_orders = Vec::with_capacity(order_rows.len());
    for r in order_rows {
        test_orders.push(TestOrderView {
            id: r.try_get("test_order_id").map_err(StoreError::Db)?,
            lab_test_id: r.try_get("lab_test_id").map_err(StoreError::Db)?,
            test_code: r.try_get("test_code").map_err(StoreError::Db)?,
            test_name: r.try_get("test_name").map_err(StoreError::Db)?,
            price_in_paise: r.try_get("price_in_paise").map_err(StoreError::Db)?,
            ref_range: r.try_get("ref_range").map_err(StoreError::Db)?,
            unit: r.try_get("unit").map_err(StoreError::Db)?,
            ordered_at: r.try_get("ordered_at").map_err(StoreError::Db)?,
        });
    }

    Ok(VisitDetail {
        visit_id: head.try_get("visit_id").map_err(StoreError::Db)?,
        branch_code: head.try_get("branch_code").map_err(StoreError::Db)?,
        patient: PatientView {
            id: head.try_get("patient_id").map_err(StoreError::Db)?,
            full_name: head.try_get("full_name").map_err(StoreError::Db)?,
            phone: head.try_get("phone").map_err(StoreError::Db)?,
            sex: head.try_get("sex").map_err(StoreError::Db)?,
            born_on: head.try_get("born_on").map_err(StoreError::Db)?,
            created_at: head.try_get("patient_created_at").map_err(StoreError::Db)?,
        },
        referred_by: head.try_get("referred_by").map_err(StoreError::Db)?,
        bill,
        test_orders,
        report: ReportSummary {
            report_id: report_row.try_get("report_id").map_err(StoreError::Db)?,
            current_version: report_row
                .try_get("current_version")
                .map_err(StoreError::Db)?,
            status: report_row.try_get("status").map_err(StoreError::Db)?,
            finalized_at: report_row.try_get("finalized_at").map_err(StoreError::Db)?,
        },
        created_at: head.try_get("created_at").map_err(StoreError::Db)?,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Trim, reject empties, and surface duplicates within one request as the
/// same conflict a duplicate against existing orders produces.
fn normalize_requested_codes(raw: &[String]) -> Result<Vec<String>, StoreError> {
    if raw.is_empty() {
        return Err(StoreError::Validation {
            message: "at least one test must be ordered".into(),
        });
    }

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut dups: Vec<String> = Vec::new();
    let mut codes: Vec<String> = Vec::new();
    for c in raw {
        let code = c.trim().to_string();
        if code.is_empty() {
            return Err(StoreError::Validation {
                message: "test codes must not be empty".into(),
            });
        }
        if seen.insert(code.clone()) {
            codes.push(code);
        } else if !dups.contains(&code) {
            dups.push(code);
        }
    }
    if !dups.is_empty() {
        return Err(StoreError::DuplicateTests { codes: dups });
    }
    Ok(codes)
}

/// Fetch ACTIVE catalog rows for the requested codes; every code must
/// resolve or the whole request is rejected.
async fn fetch_catalog_snapshots(
    tx: &mut Transaction<'_, Postgres>,
    codes: &[String],
) -> Result<Vec<CatalogSnapshot>, StoreError> {
    let rows = sqlx::query(
        r#"
        select lab_test_id, code, name, price_in_paise, ref_range, unit
        from lab_tests
        where code = any($1)
          and active
        order by code
        "#,
    )
    .bind(codes)
    .fetch_all(&mut **tx)
    .await?;

    let mut snapshots = Vec::with_capacity(rows.len());
    for r in rows {
        snapshots.push(CatalogSnapshot {
            lab_test_id: r.try_get("lab_test_id").map_err(StoreError::Db)?,
            code: r.try_get("code").map_err(StoreError::Db)?,
            name: r.try_get("name").map_err(StoreError::Db)?,
            price_in_paise: r.try_get("price_in_paise").map_err(StoreError::Db)?,
            ref_range: r.try_get("ref_range").map_err(StoreError::Db)?,
            unit: r.try_get("unit").map_err(StoreError::Db)?,
        });
    }

    if snapshots.len() != codes.len() {
        let found: BTreeSet<&str> = snapshots.iter().map(|s| s.code.as_str()).collect();
        let missing: Vec<&str> = codes
            .iter()
            .map(|c| c.as_str())
            .filter(|c| !found.contains(c))
            .collect();
        return Err(StoreError::Validation {
            message: format!("unknown or inactive test codes: {}", missing.join(", ")),
        });
    }

    Ok(snapshots)
}

async fn insert_order_snapshots(
    tx: &mut Transaction<'_, Postgres>,
    visit_id: Uuid,
    snapshots: &[CatalogSnapshot],
) -> Result<(), StoreError> {
    for s in snapshots {
        sqlx::query(
            r#"
            insert into test_orders (
                test_order_id, visit_id, lab_test_id,
                test_code, test_name, price_in_paise, ref_range, unit
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(visit_id)
        .bind(s.lab_test_id)
        .bind(&s.code)
        .bind(&s.name)
        .bind(s.price_in_paise)
        .bind(&s.ref_range)
        .bind(&s.unit)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Recompute `subtotal = sum(order prices)` and `net = subtotal - discount`
/// from current rows, inside the caller's transaction. Rejects the change
/// if the standing discount would exceed the new subtotal.
async fn rewrite_bill_totals(
    tx: &mut Transaction<'_, Postgres>,
    visit_id: Uuid,
) -> Result<BillTotals, StoreError> {
    let row = sqlx::query(
        r#"
        select
            b.discount_paise,
            coalesce((
                select sum(t.price_in_paise)
                from test_orders t
                where t.visit_id = b.visit_id
            ), 0)::bigint as subtotal_paise
        from bills b
        where b.visit_id = $1
        "#,
    )
    .bind(visit_id)
    .fetch_one(&mut **tx)
    .await?;

    let discount: i64 = row.try_get("discount_paise").map_err(StoreError::Db)?;
    let subtotal: i64 = row.try_get("subtotal_paise").map_err(StoreError::Db)?;
    let totals = BillTotals::new(subtotal, discount)?;

    sqlx::query(
        r#"
        update bills
        set subtotal_paise = $2,
            net_paise = $3
        where visit_id = $1
        "#,
    )
    .bind(visit_id)
    .bind(totals.subtotal_paise)
    .bind(totals.net_paise)
    .execute(&mut **tx)
    .await?;

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_request_rejected() {
        assert!(matches!(
            normalize_requested_codes(&[]),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn duplicate_codes_within_request_conflict() {
        let err = normalize_requested_codes(&strings(&["CBC", "LFT", "CBC"])).unwrap_err();
        match err {
            StoreError::DuplicateTests { codes } => assert_eq!(codes, vec!["CBC".to_string()]),
            other => panic!("expected DuplicateTests, got {other:?}"),
        }
    }

    #[test]
    fn codes_are_trimmed_and_order_preserved() {
        let codes = normalize_requested_codes(&strings(&[" LFT ", "CBC"])).unwrap();
        assert_eq!(codes, vec!["LFT".to_string(), "CBC".to_string()]);
    }
}
