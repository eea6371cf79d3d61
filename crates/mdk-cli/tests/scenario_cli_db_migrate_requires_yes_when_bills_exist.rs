use mdk_billing::BranchCode;
use predicates::prelude::*;
use uuid::Uuid;

/// `mdk db migrate` must refuse when the database already holds issued bills
/// unless --yes. A populated billing table means receipts are in patients'
/// hands; schema changes need an explicit acknowledgement.
///
/// DB-backed test, skipped if MDK_DATABASE_URL is not set.
#[tokio::test]
async fn cli_db_migrate_requires_yes_when_bills_exist() -> anyhow::Result<()> {
    let url = match std::env::var(mdk_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: MDK_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("SKIP: cannot connect to DB: {e}");
            return Ok(());
        }
    };
    mdk_db::migrate(&pool).await?;

    // Seed one real visit so at least one bill exists. Unique branch and
    // test code avoid collisions with other tests / local data.
    let tag = Uuid::new_v4().simple().to_string().to_uppercase();
    let branch = BranchCode::new(format!("C{}", &tag[..5]))?;
    let code = format!("CLI{}", &tag[..6]);

    mdk_db::upsert_lab_test(
        &pool,
        &mdk_db::UpsertLabTest {
            code: code.clone(),
            name: "Migrate guard probe".to_string(),
            price_in_paise: 10_000,
            ref_range: None,
            unit: None,
            active: true,
        },
        "test",
    )
    .await?;
    let patient = mdk_db::insert_patient(
        &pool,
        &mdk_db::NewPatient {
            full_name: "Migrate Guard".to_string(),
            phone: None,
            sex: None,
            born_on: None,
        },
        "test",
    )
    .await?;
    mdk_db::create_visit(
        &pool,
        mdk_config::AllocatorConfig::default(),
        &mdk_db::NewVisit {
            branch,
            patient_id: patient.id,
            referred_by: None,
            test_codes: vec![code],
            discount_paise: 0,
            actor: "test".to_string(),
        },
    )
    .await?;

    // Without --yes => must fail with refusal message.
    let mut cmd = assert_cmd::Command::cargo_bin("mdk-cli")?;
    cmd.env(mdk_db::ENV_DB_URL, &url).args(["db", "migrate"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("REFUSING MIGRATE"));

    // With --yes => should succeed (migrations are idempotent).
    let mut cmd2 = assert_cmd::Command::cargo_bin("mdk-cli")?;
    cmd2.env(mdk_db::ENV_DB_URL, &url)
        .args(["db", "migrate", "--yes"]);
    cmd2.assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));

    // `db status` reports the schema regardless.
    let mut cmd3 = assert_cmd::Command::cargo_bin("mdk-cli")?;
    cmd3.env(mdk_db::ENV_DB_URL, &url).args(["db", "status"]);
    cmd3.assert()
        .success()
        .stdout(predicate::str::contains("has_bills_table=true"));

    Ok(())
}
