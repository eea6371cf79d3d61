//! Shared fixtures for cross-crate integration scenarios.
//!
//! Everything here is test support. Codes are randomized so suites can share
//! one database, and seeding goes through the public mdk-db operations
//! rather than raw SQL, so fixtures pass the same gates as production
//! writes (and leave the same audit rows behind).

use anyhow::{Context, Result};
use mdk_billing::BranchCode;
use mdk_config::AllocatorConfig;
use mdk_schemas::VisitDetail;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// A branch code no other test run will have touched: `T` + 5 random hex
/// chars, so its sequence counters always start from zero.
pub fn unique_branch() -> BranchCode {
    let tag = Uuid::new_v4().simple().to_string().to_uppercase();
    BranchCode::new(format!("T{}", &tag[..5])).expect("generated branch code is valid")
}

/// A catalog code unique to this test run.
pub fn unique_code(prefix: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{prefix}{}", &tag[..6])
}

/// Connect and migrate, or print a SKIP line and return None when
/// MDK_DATABASE_URL is not set. Callers early-return Ok(()) on None.
pub async fn pool_from_env() -> Result<Option<PgPool>> {
    let url = match std::env::var(mdk_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: MDK_DATABASE_URL not set");
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .context("connect to test database")?;
    mdk_db::migrate(&pool).await?;
    Ok(Some(pool))
}

/// Insert one active catalog row per price; returns the generated codes in
/// the same order.
pub async fn seed_catalog(pool: &PgPool, prefix: &str, prices: &[i64]) -> Result<Vec<String>> {
    let mut codes = Vec::with_capacity(prices.len());
    for price in prices {
        let code = unique_code(prefix);
        mdk_db::upsert_lab_test(
            pool,
            &mdk_db::UpsertLabTest {
                code: code.clone(),
                name: format!("{code} panel"),
                price_in_paise: *price,
                ref_range: None,
                unit: None,
                active: true,
            },
            "testkit",
        )
        .await?;
        codes.push(code);
    }
    Ok(codes)
}

pub async fn seed_patient(pool: &PgPool, full_name: &str) -> Result<Uuid> {
    let p = mdk_db::insert_patient(
        pool,
        &mdk_db::NewPatient {
            full_name: full_name.to_string(),
            phone: None,
            sex: None,
            born_on: None,
        },
        "testkit",
    )
    .await?;
    Ok(p.id)
}

/// A fully created visit on a fresh branch, ready for lifecycle scenarios.
#[derive(Debug, Clone)]
pub struct SeededVisit {
    pub branch: BranchCode,
    pub patient_id: Uuid,
    pub visit_id: Uuid,
    pub codes: Vec<String>,
    pub detail: VisitDetail,
}

/// Fresh branch + catalog rows + patient + visit, all through the public
/// operations.
pub async fn seed_visit(
    pool: &PgPool,
    prices: &[i64],
    discount_paise: i64,
) -> Result<SeededVisit> {
    let branch = unique_branch();
    let codes = seed_catalog(pool, "TK", prices).await?;
    let patient_id = seed_patient(pool, "Testkit Patient").await?;

    let detail = mdk_db::create_visit(
        pool,
        AllocatorConfig::default(),
        &mdk_db::NewVisit {
            branch: branch.clone(),
            patient_id,
            referred_by: None,
            test_codes: codes.clone(),
            discount_paise,
            actor: "testkit".to_string(),
        },
    )
    .await?;

    Ok(SeededVisit {
        branch,
        patient_id,
        visit_id: detail.visit_id,
        codes,
        detail,
    })
}
