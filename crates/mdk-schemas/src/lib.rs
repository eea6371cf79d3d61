//! Shared view models crossing crate boundaries.
//!
//! Everything here is `Serialize + Deserialize` so the API can encode it,
//! the CLI and tests can decode it, and `mdk-db` can assemble it from rows.
//! No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientView {
    pub id: Uuid,
    pub full_name: String,
    pub phone: Option<String>,
    pub sex: Option<String>,
    pub born_on: Option<chrono::NaiveDate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTestView {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price_in_paise: i64,
    pub ref_range: Option<String>,
    pub unit: Option<String>,
    pub active: bool,
}

/// One ordered test on a visit. All catalog fields are snapshots captured at
/// order-creation time; later catalog edits never flow back into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOrderView {
    pub id: Uuid,
    pub lab_test_id: Uuid,
    pub test_code: String,
    pub test_name: String,
    pub price_in_paise: i64,
    pub ref_range: Option<String>,
    pub unit: Option<String>,
    pub ordered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillView {
    pub id: Uuid,
    pub branch_code: String,
    /// Bit-exact contract: `D-{BRANCH_CODE}-{5-digit zero-padded sequence}`.
    pub bill_number: String,
    pub subtotal_paise: i64,
    pub discount_paise: i64,
    pub net_paise: i64,
    pub issued_at: DateTime<Utc>,
    /// Human-facing issue timestamp rendered in Asia/Kolkata for print layouts.
    pub issued_at_ist: String,
}

/// Report state as embedded in a visit view.
/// `status` is the current version's status string ("DRAFT" | "FINALIZED").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub report_id: Uuid,
    pub current_version: i32,
    pub status: String,
    /// Set at the FIRST finalization and sticky thereafter. Test orders are
    /// locked from that point on, across amendment versions.
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportVersionView {
    pub version_num: i32,
    pub status: String,
    pub results: serde_json::Value,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportView {
    pub report_id: Uuid,
    pub visit_id: Uuid,
    pub current_version: i32,
    pub finalized_at: Option<DateTime<Utc>>,
    pub versions: Vec<ReportVersionView>,
}

/// The consistent read model for one diagnostic visit: patient, bill, test
/// orders and report state assembled in a single query scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitDetail {
    pub visit_id: Uuid,
    pub branch_code: String,
    pub patient: PatientView,
    pub referred_by: Option<Uuid>,
    pub bill: BillView,
    pub test_orders: Vec<TestOrderView>,
    pub report: ReportSummary,
    pub created_at: DateTime<Utc>,
}
