//! Axum router and all HTTP handlers for mdk-api.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! Branch scoping: every `/v1/visits/diagnostic` route requires an
//! `X-Branch-Id` header naming an ACTIVE branch from the config registry.
//! A visit owned by another branch reads as 404, so branch identifiers are
//! never confirmed by probing. `X-Actor-Id` is optional and lands in the
//! audit trail.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    api_types::{
        AddTestsRequest, CatalogQuery, CreatePatientRequest, CreateVisitRequest, HealthResponse,
        SaveResultsRequest, StatusResponse,
    },
    error::ApiError,
    state::AppState,
};
use mdk_billing::BranchCode;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/patients", post(create_patient))
        .route("/v1/patients/:patient_id", get(get_patient))
        .route("/v1/catalog/tests", get(list_tests))
        .route("/v1/visits/diagnostic", post(create_visit))
        .route("/v1/visits/diagnostic/:visit_id", get(get_visit))
        .route("/v1/visits/diagnostic/:visit_id/tests", post(add_tests))
        .route(
            "/v1/visits/diagnostic/:visit_id/tests/:test_order_id",
            delete(remove_test),
        )
        .route("/v1/visits/diagnostic/:visit_id/results", put(save_results))
        .route("/v1/visits/diagnostic/:visit_id/finalize", post(finalize))
        .route("/v1/visits/diagnostic/:visit_id/amend", post(amend))
        .route("/v1/visits/diagnostic/:visit_id/report", get(get_report))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Header helpers
// ---------------------------------------------------------------------------

/// Resolve `X-Branch-Id` against the ACTIVE branch registry.
fn require_branch(st: &AppState, headers: &HeaderMap) -> Result<BranchCode, ApiError> {
    let raw = headers
        .get("x-branch-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingBranchHeader)?;

    match st.config.branch(raw) {
        Some(b) => Ok(b.code.clone()),
        None => Err(ApiError::UnknownBranch {
            branch: raw.to_string(),
        }),
    }
}

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unattributed")
        .to_string()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let (db_ok, has_bills_table) = match mdk_db::status(&st.pool).await {
        Ok(s) => (s.ok, s.has_bills_table),
        Err(_) => (false, false),
    };

    let branches = st
        .config
        .branches
        .iter()
        .filter(|b| b.active)
        .map(|b| b.code.as_str().to_string())
        .collect();

    (
        StatusCode::OK,
        Json(StatusResponse {
            ok: db_ok,
            db_ok,
            has_bills_table,
            config_hash: st.config_hash.clone(),
            branches,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/patients
// ---------------------------------------------------------------------------

pub(crate) async fn create_patient(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreatePatientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from(&headers);
    let patient = mdk_db::insert_patient(
        &st.pool,
        &mdk_db::NewPatient {
            full_name: req.full_name,
            phone: req.phone,
            sex: req.sex,
            born_on: req.born_on,
        },
        &actor,
    )
    .await?;

    info!(patient_id = %patient.id, "patients/create");
    Ok((StatusCode::CREATED, Json(patient)))
}

// ---------------------------------------------------------------------------
// GET /v1/patients/:patient_id
// ---------------------------------------------------------------------------

pub(crate) async fn get_patient(
    State(st): State<Arc<AppState>>,
    Path(patient_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let patient = mdk_db::fetch_patient(&st.pool, patient_id).await?;
    Ok((StatusCode::OK, Json(patient)))
}

// ---------------------------------------------------------------------------
// GET /v1/catalog/tests
// ---------------------------------------------------------------------------

pub(crate) async fn list_tests(
    State(st): State<Arc<AppState>>,
    Query(q): Query<CatalogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tests = mdk_db::list_lab_tests(&st.pool, q.include_inactive).await?;
    Ok((StatusCode::OK, Json(tests)))
}

// ---------------------------------------------------------------------------
// POST /v1/visits/diagnostic
// ---------------------------------------------------------------------------

pub(crate) async fn create_visit(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateVisitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let visit = mdk_db::create_visit(
        &st.pool,
        st.config.allocator,
        &mdk_db::NewVisit {
            branch,
            patient_id: req.patient_id,
            referred_by: req.referred_by,
            test_codes: req.test_codes,
            discount_paise: req.discount_paise,
            actor,
        },
    )
    .await?;

    info!(
        visit_id = %visit.visit_id,
        bill_number = %visit.bill.bill_number,
        tests = visit.test_orders.len(),
        "visits/create"
    );
    Ok((StatusCode::CREATED, Json(visit)))
}

// ---------------------------------------------------------------------------
// GET /v1/visits/diagnostic/:visit_id
// ---------------------------------------------------------------------------

pub(crate) async fn get_visit(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let visit = mdk_db::fetch_visit(&st.pool, visit_id, Some(&branch)).await?;
    Ok((StatusCode::OK, Json(visit)))
}

// ---------------------------------------------------------------------------
// POST /v1/visits/diagnostic/:visit_id/tests
// ---------------------------------------------------------------------------

pub(crate) async fn add_tests(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<AddTestsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let visit = mdk_db::add_tests(&st.pool, visit_id, &branch, &req.test_codes, &actor).await?;

    info!(
        visit_id = %visit_id,
        tests = visit.test_orders.len(),
        net_paise = visit.bill.net_paise,
        "visits/add_tests"
    );
    Ok((StatusCode::OK, Json(visit)))
}

// ---------------------------------------------------------------------------
// DELETE /v1/visits/diagnostic/:visit_id/tests/:test_order_id
// ---------------------------------------------------------------------------

pub(crate) async fn remove_test(
    State(st): State<Arc<AppState>>,
    Path((visit_id, test_order_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let visit = mdk_db::remove_test(&st.pool, visit_id, &branch, test_order_id, &actor).await?;

    info!(
        visit_id = %visit_id,
        test_order_id = %test_order_id,
        net_paise = visit.bill.net_paise,
        "visits/remove_test"
    );
    Ok((StatusCode::OK, Json(visit)))
}

// ---------------------------------------------------------------------------
// PUT /v1/visits/diagnostic/:visit_id/results
// ---------------------------------------------------------------------------

pub(crate) async fn save_results(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<SaveResultsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let report = mdk_db::save_results(&st.pool, visit_id, &branch, &req.results, &actor).await?;

    info!(
        visit_id = %visit_id,
        version = report.current_version,
        "reports/save_results"
    );
    Ok((StatusCode::OK, Json(report)))
}

// ---------------------------------------------------------------------------
// POST /v1/visits/diagnostic/:visit_id/finalize
// ---------------------------------------------------------------------------

pub(crate) async fn finalize(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let report = mdk_db::finalize_report(&st.pool, visit_id, &branch, &actor).await?;

    info!(
        visit_id = %visit_id,
        version = report.current_version,
        by = %actor,
        "reports/finalize"
    );
    Ok((StatusCode::OK, Json(report)))
}

// ---------------------------------------------------------------------------
// POST /v1/visits/diagnostic/:visit_id/amend
// ---------------------------------------------------------------------------

pub(crate) async fn amend(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let actor = actor_from(&headers);

    let report = mdk_db::open_amendment(&st.pool, visit_id, &branch, &actor).await?;

    info!(
        visit_id = %visit_id,
        version = report.current_version,
        by = %actor,
        "reports/amend"
    );
    Ok((StatusCode::OK, Json(report)))
}

// ---------------------------------------------------------------------------
// GET /v1/visits/diagnostic/:visit_id/report
// ---------------------------------------------------------------------------

pub(crate) async fn get_report(
    State(st): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let branch = require_branch(&st, &headers)?;
    let report = mdk_db::fetch_report(&st.pool, visit_id, Some(&branch)).await?;
    Ok((StatusCode::OK, Json(report)))
}
