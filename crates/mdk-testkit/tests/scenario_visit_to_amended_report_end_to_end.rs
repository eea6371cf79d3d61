//! Scenario: the full clinical paper trail, front desk to amended report.
//!
//! # Invariants under test
//!
//! 1. Visit creation yields the branch's first bill number and a v1 DRAFT.
//! 2. Finalization freezes test orders for good; v2 amendments reopen
//!    results only.
//! 3. The branch's audit trail lists exactly the committed operations, in
//!    order, and exports as a verifiable hash chain.
//!
//! DB-backed test, skipped if MDK_DATABASE_URL is not set.

use mdk_audit::{actions, AuditRecord, ChainWriter, VerifyResult};
use mdk_db::StoreError;
use serde_json::json;

#[tokio::test]
async fn visit_to_amended_report_end_to_end() -> anyhow::Result<()> {
    let Some(pool) = mdk_testkit::pool_from_env().await? else {
        return Ok(());
    };

    let seeded = mdk_testkit::seed_visit(&pool, &[35_000, 55_000], 10_000).await?;
    let branch = &seeded.branch;

    assert_eq!(
        seeded.detail.bill.bill_number,
        format!("D-{branch}-00001"),
        "fresh branch starts its diagnostic sequence at 1"
    );
    assert_eq!(seeded.detail.bill.net_paise, 80_000);
    assert_eq!(seeded.detail.test_orders.len(), 2);
    assert_eq!(seeded.detail.report.status, "DRAFT");

    // Lab work: enter results, then the doctor signs off.
    let results = json!({
        (seeded.codes[0].clone()): {"value": "6.1", "unit": "mmol/L"},
        (seeded.codes[1].clone()): {"value": "41", "unit": "U/L"},
    });
    mdk_db::save_results(&pool, seeded.visit_id, branch, &results, "lab-tech-2").await?;

    let report = mdk_db::finalize_report(&pool, seeded.visit_id, branch, "dr-rao").await?;
    assert_eq!(report.versions[0].status, "FINALIZED");
    assert_eq!(report.versions[0].finalized_by.as_deref(), Some("dr-rao"));
    assert!(report.finalized_at.is_some(), "sticky finalized_at is set");

    // Billing is closed: both order mutations refuse.
    let extra = mdk_testkit::seed_catalog(&pool, "TK", &[15_000]).await?;
    let err = mdk_db::add_tests(&pool, seeded.visit_id, branch, &extra, "reception")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ReportFinalized), "{err}");

    let order_id = seeded.detail.test_orders[0].id;
    let err = mdk_db::remove_test(&pool, seeded.visit_id, branch, order_id, "reception")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ReportFinalized), "{err}");

    // Amendment: v2 opens as a draft carrying v1 results forward.
    let report = mdk_db::open_amendment(&pool, seeded.visit_id, branch, "dr-rao").await?;
    assert_eq!(report.current_version, 2);
    assert_eq!(report.versions[1].status, "DRAFT");
    assert_eq!(
        report.versions[1].results, report.versions[0].results,
        "amendment starts from the finalized results"
    );

    let amended = json!({
        (seeded.codes[0].clone()): {"value": "5.8", "unit": "mmol/L"},
        (seeded.codes[1].clone()): {"value": "41", "unit": "U/L"},
    });
    mdk_db::save_results(&pool, seeded.visit_id, branch, &amended, "lab-tech-2").await?;
    let report = mdk_db::finalize_report(&pool, seeded.visit_id, branch, "dr-mehta").await?;

    assert_eq!(report.versions.len(), 2);
    assert_eq!(report.versions[0].status, "FINALIZED");
    assert_eq!(report.versions[1].status, "FINALIZED");
    assert_eq!(
        report.versions[0].results[&seeded.codes[0]]["value"],
        json!("6.1"),
        "v1 stays frozen through the amendment"
    );
    assert_eq!(
        report.versions[1].results[&seeded.codes[0]]["value"],
        json!("5.8")
    );

    // Orders stay locked across versions.
    let err = mdk_db::remove_test(&pool, seeded.visit_id, branch, order_id, "reception")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ReportFinalized), "{err}");

    let detail = mdk_db::fetch_visit(&pool, seeded.visit_id, Some(branch)).await?;
    assert_eq!(detail.report.status, "FINALIZED");
    assert_eq!(detail.report.current_version, 2);
    assert_eq!(detail.test_orders.len(), 2, "failed mutations changed nothing");

    // The branch trail holds exactly the committed operations, in order.
    let mut rows = Vec::new();
    let mut after = 0i64;
    loop {
        let page = mdk_db::fetch_audit_page(&pool, after, 200).await?;
        let Some(last) = page.last() else { break };
        after = last.audit_id;
        rows.extend(page);
    }
    let trail: Vec<_> = rows
        .iter()
        .filter(|r| r.branch_code == branch.as_str())
        .collect();
    let got: Vec<&str> = trail.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(
        got,
        vec![
            actions::VISIT_CREATE,
            actions::REPORT_SAVE_RESULTS,
            actions::REPORT_FINALIZE,
            actions::REPORT_AMEND,
            actions::REPORT_SAVE_RESULTS,
            actions::REPORT_FINALIZE,
        ],
        "rolled-back mutations leave no trace"
    );

    // The same rows export as a verifiable hash chain.
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("trail.jsonl");
    let mut writer = ChainWriter::new(&path)?;
    for row in &trail {
        writer.append(AuditRecord {
            seq: row.audit_id,
            at: row.at,
            branch_code: row.branch_code.clone(),
            actor: row.actor.clone(),
            action: row.action.clone(),
            entity: row.entity.clone(),
            entity_id: row.entity_id.clone(),
            detail: row.detail.clone(),
            hash_prev: None,
            hash_self: None,
        })?;
    }
    assert_eq!(
        mdk_audit::verify_chain(&path)?,
        VerifyResult::Valid { lines: 6 }
    );

    Ok(())
}
