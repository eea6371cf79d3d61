//! Request and response types for all mdk-api HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here; the read
//! models (`VisitDetail`, `ReportView`, ...) come from mdk-schemas.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health  /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub db_ok: bool,
    pub has_bills_table: bool,
    pub config_hash: String,
    /// Active branch codes this instance will accept in `X-Branch-Id`.
    pub branches: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error body: every non-2xx response carries this shape
// ---------------------------------------------------------------------------

/// `error` is a stable machine-readable code; `message` is for humans and
/// may change wording between releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// /v1/patients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePatientRequest {
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// "M" | "F" | "O"
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub born_on: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// /v1/catalog/tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

// ---------------------------------------------------------------------------
// /v1/visits/diagnostic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVisitRequest {
    pub patient_id: Uuid,
    #[serde(default)]
    pub referred_by: Option<Uuid>,
    pub test_codes: Vec<String>,
    #[serde(default)]
    pub discount_paise: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTestsRequest {
    pub test_codes: Vec<String>,
}

/// Body for PUT .../results. `results` must be a JSON object keyed by test
/// code; the per-test value shape is owned by the reporting staff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResultsRequest {
    pub results: serde_json::Value,
}
