//! Scenario: every front desk wins a different bill number.
//!
//! # Invariants under test
//!
//! 1. N concurrent `create_visit` calls on one branch all succeed and the
//!    issued numbers are exactly 1..=N (distinct, consecutive, no reuse).
//! 2. Two branches allocating at the same time never see each other's
//!    counters.
//!
//! DB-backed test, skipped if MDK_DATABASE_URL is not set.

use mdk_billing::{BillNumber, SequenceDomain};
use mdk_config::AllocatorConfig;
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_visit_creation_yields_distinct_consecutive_bills() -> anyhow::Result<()> {
    let Some(pool) = mdk_testkit::pool_from_env().await? else {
        return Ok(());
    };

    let branch = mdk_testkit::unique_branch();
    let codes = mdk_testkit::seed_catalog(&pool, "CC", &[12_500]).await?;
    let patient_id = mdk_testkit::seed_patient(&pool, "Rush Hour").await?;

    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        let branch = branch.clone();
        let codes = codes.clone();
        handles.push(tokio::spawn(async move {
            mdk_db::create_visit(
                &pool,
                AllocatorConfig::default(),
                &mdk_db::NewVisit {
                    branch,
                    patient_id,
                    referred_by: None,
                    test_codes: codes,
                    discount_paise: 0,
                    actor: format!("desk-{i}"),
                },
            )
            .await
        }));
    }

    let mut numbers = Vec::new();
    for h in handles {
        let detail = h.await??;
        numbers.push(detail.bill.bill_number);
    }

    let distinct: HashSet<&String> = numbers.iter().collect();
    assert_eq!(distinct.len(), 12, "no duplicate bill numbers: {numbers:?}");

    let mut sequences = Vec::new();
    for n in &numbers {
        let parsed = BillNumber::parse(n)?;
        assert_eq!(parsed.domain, SequenceDomain::Diagnostic);
        assert_eq!(parsed.branch, branch);
        sequences.push(parsed.sequence);
    }
    sequences.sort_unstable();
    assert_eq!(
        sequences,
        (1..=12).collect::<Vec<i64>>(),
        "all succeeded, so the sequence has no gaps"
    );

    assert_eq!(
        mdk_db::peek_sequence(&pool, &branch, SequenceDomain::Diagnostic).await?,
        Some(12)
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_branches_keep_independent_counters() -> anyhow::Result<()> {
    let Some(pool) = mdk_testkit::pool_from_env().await? else {
        return Ok(());
    };

    let branch_a = mdk_testkit::unique_branch();
    let branch_b = mdk_testkit::unique_branch();
    let codes = mdk_testkit::seed_catalog(&pool, "IB", &[9_900]).await?;
    let patient_id = mdk_testkit::seed_patient(&pool, "Two Branches").await?;

    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        let branch = if i % 2 == 0 {
            branch_a.clone()
        } else {
            branch_b.clone()
        };
        let codes = codes.clone();
        handles.push(tokio::spawn(async move {
            mdk_db::create_visit(
                &pool,
                AllocatorConfig::default(),
                &mdk_db::NewVisit {
                    branch,
                    patient_id,
                    referred_by: None,
                    test_codes: codes,
                    discount_paise: 0,
                    actor: format!("desk-{i}"),
                },
            )
            .await
        }));
    }

    let mut seq_a = Vec::new();
    let mut seq_b = Vec::new();
    for h in handles {
        let detail = h.await??;
        let parsed = BillNumber::parse(&detail.bill.bill_number)?;
        if parsed.branch == branch_a {
            seq_a.push(parsed.sequence);
        } else {
            assert_eq!(parsed.branch, branch_b);
            seq_b.push(parsed.sequence);
        }
    }

    seq_a.sort_unstable();
    seq_b.sort_unstable();
    let expected: Vec<i64> = (1..=6).collect();
    assert_eq!(seq_a, expected, "branch A counts its own visits only");
    assert_eq!(seq_b, expected, "branch B counts its own visits only");

    Ok(())
}
