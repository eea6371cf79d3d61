//! Patient registry and lab-test catalog.
//!
//! Catalog rows are the PRICE SOURCE at order time only: visits snapshot
//! code, name, price, ref range and unit into `test_orders`, after which
//! catalog edits are invisible to existing visits. CSV import follows a
//! reject-don't-fix policy: malformed rows are counted per reject bucket and
//! skipped, valid rows upsert by code.

use crate::{insert_audit_tx, NewAuditRow, StoreError};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use mdk_schemas::{LabTestView, PatientView};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::path::PathBuf;
use uuid::Uuid;

/// Catalog and import actions are not scoped to a branch; the audit trail
/// records this sentinel instead of a branch code.
const ALL_BRANCHES: &str = "ALL";

// ---------------------------------------------------------------------------
// Patients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewPatient {
    pub full_name: String,
    pub phone: Option<String>,
    pub sex: Option<String>,
    pub born_on: Option<NaiveDate>,
}

pub async fn insert_patient(
    pool: &PgPool,
    p: &NewPatient,
    actor: &str,
) -> Result<PatientView, StoreError> {
    let full_name = p.full_name.trim();
    if full_name.is_empty() {
        return Err(StoreError::Validation {
            message: "full_name must not be empty".into(),
        });
    }
    if let Some(sex) = p.sex.as_deref() {
        if !matches!(sex, "M" | "F" | "O") {
            return Err(StoreError::Validation {
                message: format!("sex must be M, F or O (got {sex:?})"),
            });
        }
    }

    let patient_id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        insert into patients (patient_id, full_name, phone, sex, born_on)
        values ($1, $2, $3, $4, $5)
        returning created_at
        "#,
    )
    .bind(patient_id)
    .bind(full_name)
    .bind(&p.phone)
    .bind(&p.sex)
    .bind(p.born_on)
    .fetch_one(&mut *tx)
    .await?;
    let created_at = row.try_get("created_at").map_err(StoreError::Db)?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: ALL_BRANCHES,
            actor,
            action: mdk_audit::actions::PATIENT_CREATE,
            entity: "patient",
            entity_id: patient_id.to_string(),
            detail: serde_json::json!({ "full_name": full_name }),
        },
    )
    .await?;

    tx.commit().await?;

    Ok(PatientView {
        id: patient_id,
        full_name: full_name.to_string(),
        phone: p.phone.clone(),
        sex: p.sex.clone(),
        born_on: p.born_on,
        created_at,
    })
}

pub async fn fetch_patient(pool: &PgPool, patient_id: Uuid) -> Result<PatientView, StoreError> {
    let row = sqlx::query(
        r#"
        select patient_id, full_name, phone, sex, born_on, created_at
        from patients
        where patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound { entity: "patient" })?;

    Ok(PatientView {
        id: row.try_get("patient_id").map_err(StoreError::Db)?,
        full_name: row.try_get("full_name").map_err(StoreError::Db)?,
        phone: row.try_get("phone").map_err(StoreError::Db)?,
        sex: row.try_get("sex").map_err(StoreError::Db)?,
        born_on: row.try_get("born_on").map_err(StoreError::Db)?,
        created_at: row.try_get("created_at").map_err(StoreError::Db)?,
    })
}

// ---------------------------------------------------------------------------
// Lab-test catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpsertLabTest {
    pub code: String,
    pub name: String,
    pub price_in_paise: i64,
    pub ref_range: Option<String>,
    pub unit: Option<String>,
    pub active: bool,
}

/// Insert-or-update one catalog entry by code. Returns the stored row plus
/// whether it was newly inserted.
pub async fn upsert_lab_test(
    pool: &PgPool,
    t: &UpsertLabTest,
    actor: &str,
) -> Result<(LabTestView, bool), StoreError> {
    if !valid_test_code(&t.code) {
        return Err(StoreError::Validation {
            message: format!(
                "invalid test code {:?}: expected 2..=16 uppercase ASCII alphanumerics/underscore",
                t.code
            ),
        });
    }
    if t.name.trim().is_empty() {
        return Err(StoreError::Validation {
            message: "test name must not be empty".into(),
        });
    }
    if t.price_in_paise < 0 {
        return Err(StoreError::Validation {
            message: format!("price must be >= 0 (got {})", t.price_in_paise),
        });
    }

    let mut tx = pool.begin().await?;

    // inserted = (xmax = 0) in Postgres (true on insert, false on update).
    let row = sqlx::query(
        r#"
        insert into lab_tests (lab_test_id, code, name, price_in_paise, ref_range, unit, active)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (code) do update set
            name = excluded.name,
            price_in_paise = excluded.price_in_paise,
            ref_range = excluded.ref_range,
            unit = excluded.unit,
            active = excluded.active,
            updated_at = now()
        returning lab_test_id, code, name, price_in_paise, ref_range, unit, active,
                  (xmax = 0) as inserted
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&t.code)
    .bind(t.name.trim())
    .bind(t.price_in_paise)
    .bind(&t.ref_range)
    .bind(&t.unit)
    .bind(t.active)
    .fetch_one(&mut *tx)
    .await?;

    let view = lab_test_from_row(&row)?;
    let inserted: bool = row.try_get("inserted").map_err(StoreError::Db)?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: ALL_BRANCHES,
            actor,
            action: mdk_audit::actions::CATALOG_UPSERT,
            entity: "lab_test",
            entity_id: view.code.clone(),
            detail: serde_json::json!({
                "price_in_paise": view.price_in_paise,
                "active": view.active,
                "inserted": inserted,
            }),
        },
    )
    .await?;

    tx.commit().await?;
    Ok((view, inserted))
}

/// Targeted re-price of one catalog entry; name, range and unit stay put.
/// Only future orders see the new price, existing snapshots never move.
pub async fn set_lab_test_price(
    pool: &PgPool,
    code: &str,
    price_in_paise: i64,
    actor: &str,
) -> Result<LabTestView, StoreError> {
    if price_in_paise < 0 {
        return Err(StoreError::Validation {
            message: format!("price must be >= 0 (got {price_in_paise})"),
        });
    }

    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        update lab_tests
        set price_in_paise = $2,
            updated_at = now()
        where code = $1
        returning lab_test_id, code, name, price_in_paise, ref_range, unit, active
        "#,
    )
    .bind(code)
    .bind(price_in_paise)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound { entity: "lab test" })?;

    let view = lab_test_from_row(&row)?;

    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: ALL_BRANCHES,
            actor,
            action: mdk_audit::actions::CATALOG_PRICE_SET,
            entity: "lab_test",
            entity_id: view.code.clone(),
            detail: serde_json::json!({ "price_in_paise": view.price_in_paise }),
        },
    )
    .await?;

    tx.commit().await?;
    Ok(view)
}

/// List catalog entries in stable code order.
pub async fn list_lab_tests(
    pool: &PgPool,
    include_inactive: bool,
) -> Result<Vec<LabTestView>, StoreError> {
    let rows = sqlx::query(
        r#"
        select lab_test_id, code, name, price_in_paise, ref_range, unit, active
        from lab_tests
        where $1 or active
        order by code asc
        "#,
    )
    .bind(include_inactive)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(lab_test_from_row(&r)?);
    }
    Ok(out)
}

fn lab_test_from_row(row: &sqlx::postgres::PgRow) -> Result<LabTestView, StoreError> {
    Ok(LabTestView {
        id: row.try_get("lab_test_id").map_err(StoreError::Db)?,
        code: row.try_get("code").map_err(StoreError::Db)?,
        name: row.try_get("name").map_err(StoreError::Db)?,
        price_in_paise: row.try_get("price_in_paise").map_err(StoreError::Db)?,
        ref_range: row.try_get("ref_range").map_err(StoreError::Db)?,
        unit: row.try_get("unit").map_err(StoreError::Db)?,
        active: row.try_get("active").map_err(StoreError::Db)?,
    })
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CatalogImportArgs {
    pub path: PathBuf,
    pub actor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRejects {
    pub bad_row: u64,
    pub bad_code: u64,
    pub bad_name: u64,
    pub bad_price: u64,
    pub duplicate_in_batch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogImportReport {
    pub rows_read: u64,
    pub rows_ok: u64,
    pub rows_rejected: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rejects: CatalogRejects,
}

/// CSV row shape. Headers: code,name,price,ref_range,unit
/// `price` is rupees as a decimal string ("250" or "250.00"); floats are
/// never parsed.
#[derive(Debug, Deserialize)]
struct CsvCatalogRow {
    code: String,
    name: String,
    price: String,
    #[serde(default)]
    ref_range: Option<String>,
    #[serde(default)]
    unit: Option<String>,
}

/// Import catalog entries from CSV. Rejected rows are counted, never fixed
/// up; accepted rows upsert by code (import is re-runnable).
pub async fn import_lab_tests_csv(
    pool: &PgPool,
    args: CatalogImportArgs,
) -> Result<CatalogImportReport, StoreError> {
    let csv_text = std::fs::read_to_string(&args.path).map_err(|e| StoreError::Validation {
        message: format!("read catalog csv failed: {}: {e}", args.path.display()),
    })?;

    let mut report = CatalogImportReport {
        rows_read: 0,
        rows_ok: 0,
        rows_rejected: 0,
        rows_inserted: 0,
        rows_updated: 0,
        rejects: CatalogRejects::default(),
    };

    let mut seen_codes: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut rdr = csv::Reader::from_reader(csv_text.as_bytes());

    for rec in rdr.deserialize::<CsvCatalogRow>() {
        report.rows_read += 1;

        let row = match rec {
            Ok(r) => r,
            Err(_) => {
                report.rejects.bad_row += 1;
                report.rows_rejected += 1;
                continue;
            }
        };

        let code = row.code.trim().to_string();
        if !valid_test_code(&code) {
            report.rejects.bad_code += 1;
            report.rows_rejected += 1;
            continue;
        }

        if row.name.trim().is_empty() {
            report.rejects.bad_name += 1;
            report.rows_rejected += 1;
            continue;
        }

        let price_in_paise = match rupees_to_paise(&row.price) {
            Ok(v) => v,
            Err(_) => {
                report.rejects.bad_price += 1;
                report.rows_rejected += 1;
                continue;
            }
        };

        if !seen_codes.insert(code.clone()) {
            report.rejects.duplicate_in_batch += 1;
            report.rows_rejected += 1;
            continue;
        }

        let inserted: bool = sqlx::query_scalar(
            r#"
            insert into lab_tests (lab_test_id, code, name, price_in_paise, ref_range, unit, active)
            values ($1, $2, $3, $4, $5, $6, true)
            on conflict (code) do update set
                name = excluded.name,
                price_in_paise = excluded.price_in_paise,
                ref_range = excluded.ref_range,
                unit = excluded.unit,
                active = true,
                updated_at = now()
            returning (xmax = 0)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&code)
        .bind(row.name.trim())
        .bind(price_in_paise)
        .bind(normalize_optional(row.ref_range))
        .bind(normalize_optional(row.unit))
        .fetch_one(pool)
        .await?;

        report.rows_ok += 1;
        if inserted {
            report.rows_inserted += 1;
        } else {
            report.rows_updated += 1;
        }
    }

    // Single audit row summarizing the whole import.
    let detail = serde_json::to_value(&report).map_err(|e| StoreError::Internal {
        message: format!("serialize import report failed: {e}"),
    })?;
    let mut tx = pool.begin().await?;
    insert_audit_tx(
        &mut tx,
        NewAuditRow {
            branch_code: ALL_BRANCHES,
            actor: &args.actor,
            action: mdk_audit::actions::CATALOG_IMPORT,
            entity: "lab_test_catalog",
            entity_id: args.path.display().to_string(),
            detail,
        },
    )
    .await?;
    tx.commit().await?;

    Ok(report)
}

fn normalize_optional(v: Option<String>) -> Option<String> {
    v.and_then(|s| {
        let t = s.trim().to_string();
        if t.is_empty() {
            None
        } else {
            Some(t)
        }
    })
}

/// Catalog codes: 2..=16 uppercase ASCII alphanumerics/underscore. They end
/// up on printed bills and in result payload keys, so the alphabet is tight.
pub(crate) fn valid_test_code(code: &str) -> bool {
    (2..=16).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Parse a rupee decimal string into integer paise deterministically.
/// Accepts at most 2 decimal places. Rejects negatives and floats-by-accident
/// ("1e3", "1.234").
pub(crate) fn rupees_to_paise(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty price"));
    }
    if s.starts_with('-') {
        return Err(anyhow!("negative price not allowed"));
    }

    let mut parts = s.split('.');
    let int_part = parts.next().unwrap_or("0");
    let frac_part = parts.next();

    if parts.next().is_some() {
        return Err(anyhow!("invalid decimal format"));
    }

    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("invalid integer part"));
    }

    let int_val: i64 = int_part
        .parse::<i64>()
        .with_context(|| format!("parse int part failed: {}", int_part))?;

    let paise = match frac_part {
        None => 0_i64,
        Some(frac) => {
            if frac.is_empty() {
                0
            } else {
                if !frac.chars().all(|c| c.is_ascii_digit()) {
                    return Err(anyhow!("invalid fractional part"));
                }
                if frac.len() > 2 {
                    // Reject sub-paise precision outright.
                    return Err(anyhow!("too many decimals"));
                }
                let mut frac_str = frac.to_string();
                while frac_str.len() < 2 {
                    frac_str.push('0');
                }
                frac_str
                    .parse::<i64>()
                    .with_context(|| format!("parse frac part failed: {}", frac_str))?
            }
        }
    };

    int_val
        .checked_mul(100)
        .and_then(|v| v.checked_add(paise))
        .ok_or_else(|| anyhow!("price overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rupees_to_paise_basic() {
        assert_eq!(rupees_to_paise("0").unwrap(), 0);
        assert_eq!(rupees_to_paise("250").unwrap(), 25_000);
        assert_eq!(rupees_to_paise("250.5").unwrap(), 25_050);
        assert_eq!(rupees_to_paise("250.00").unwrap(), 25_000);
        assert_eq!(rupees_to_paise("0001.23").unwrap(), 123);
    }

    #[test]
    fn rupees_to_paise_rejects_bad_inputs() {
        assert!(rupees_to_paise("").is_err());
        assert!(rupees_to_paise("-5").is_err());
        assert!(rupees_to_paise("1.234").is_err());
        assert!(rupees_to_paise("1.2.3").is_err());
        assert!(rupees_to_paise("1e3").is_err());
        assert!(rupees_to_paise("abc").is_err());
        assert!(rupees_to_paise(".50").is_err());
    }

    #[test]
    fn test_code_alphabet() {
        assert!(valid_test_code("CBC"));
        assert!(valid_test_code("HBA1C"));
        assert!(valid_test_code("LIPID_PROFILE"));
        assert!(!valid_test_code("cbc"));
        assert!(!valid_test_code("C"));
        assert!(!valid_test_code("CBC-1"));
        assert!(!valid_test_code("WAY_TOO_LONG_CODE_X"));
    }
}
