//! Store-to-HTTP error mapping.
//!
//! Every failure leaves the API as `{ "error": CODE, "message": ... }`
//! with a STABLE code. Clients branch on the code, never on the message.
//!
//! | code                 | status | source                                   |
//! |----------------------|--------|------------------------------------------|
//! | VALIDATION_ERROR     | 400    | bad input, unknown codes, last-test rule |
//! | UNKNOWN_BRANCH       | 403    | missing/unregistered `X-Branch-Id`       |
//! | NOT_FOUND            | 404    | missing or cross-branch entity           |
//! | DUPLICATE_TESTS      | 409    | test already ordered on the visit        |
//! | REPORT_FINALIZED     | 409    | mutation gated by finalization           |
//! | ALREADY_FINALIZED    | 409    | repeat finalize                          |
//! | DRAFT_OPEN           | 409    | amendment over an open draft             |
//! | SEQUENCE_CONTENTION  | 503    | allocator retries exhausted              |
//! | INTERNAL             | 500    | everything else                          |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mdk_db::StoreError;

use crate::api_types::ErrorBody;

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    UnknownBranch { branch: String },
    MissingBranchHeader,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::MissingBranchHeader => (
                StatusCode::FORBIDDEN,
                body("UNKNOWN_BRANCH", "missing X-Branch-Id header".to_string()),
            ),
            ApiError::UnknownBranch { branch } => (
                StatusCode::FORBIDDEN,
                body(
                    "UNKNOWN_BRANCH",
                    format!("branch {branch:?} is not registered or not active"),
                ),
            ),
            ApiError::Store(e) => match e {
                StoreError::NotFound { entity } => (
                    StatusCode::NOT_FOUND,
                    body("NOT_FOUND", format!("{entity} not found")),
                ),
                StoreError::Validation { message } => (
                    StatusCode::BAD_REQUEST,
                    body("VALIDATION_ERROR", message.clone()),
                ),
                StoreError::DuplicateTests { codes } => {
                    let message = if codes.is_empty() {
                        "test already ordered on this visit".to_string()
                    } else {
                        format!("tests already ordered on this visit: {}", codes.join(", "))
                    };
                    (StatusCode::CONFLICT, body("DUPLICATE_TESTS", message))
                }
                StoreError::ReportFinalized => (
                    StatusCode::CONFLICT,
                    body(
                        "REPORT_FINALIZED",
                        "report is finalized; order and result mutations are locked".to_string(),
                    ),
                ),
                StoreError::AlreadyFinalized => (
                    StatusCode::CONFLICT,
                    body(
                        "ALREADY_FINALIZED",
                        "current report version is already finalized".to_string(),
                    ),
                ),
                StoreError::DraftOpen { version_num } => (
                    StatusCode::CONFLICT,
                    body(
                        "DRAFT_OPEN",
                        format!("version {version_num} is still a draft; finalize it first"),
                    ),
                ),
                StoreError::Contention { attempts } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    body(
                        "SEQUENCE_CONTENTION",
                        format!("bill number allocation contended after {attempts} attempts; retry"),
                    ),
                ),
                StoreError::Immutable | StoreError::Internal { .. } | StoreError::Db(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body("INTERNAL", "internal error".to_string()),
                ),
            },
        }
    }
}

fn body(code: &str, message: String) -> ErrorBody {
    ErrorBody {
        error: code.to_string(),
        message,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = self.status_and_body();
        if status.is_server_error() {
            // The client gets a generic body; the detail goes to the log.
            tracing::error!(error = ?self, "request failed");
        }
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes_for_each_conflict_kind() {
        let cases = [
            (ApiError::Store(StoreError::ReportFinalized), "REPORT_FINALIZED", StatusCode::CONFLICT),
            (ApiError::Store(StoreError::AlreadyFinalized), "ALREADY_FINALIZED", StatusCode::CONFLICT),
            (
                ApiError::Store(StoreError::DraftOpen { version_num: 2 }),
                "DRAFT_OPEN",
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Store(StoreError::DuplicateTests { codes: vec!["CBC".into()] }),
                "DUPLICATE_TESTS",
                StatusCode::CONFLICT,
            ),
        ];
        for (err, code, status) in cases {
            let (s, b) = err.status_and_body();
            assert_eq!(s, status);
            assert_eq!(b.error, code);
        }
    }

    #[test]
    fn db_errors_never_leak_detail() {
        let err = ApiError::Store(StoreError::Internal {
            message: "duplicate bill number D-PUNE-00007".to_string(),
        });
        let (status, b) = err.status_and_body();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(b.error, "INTERNAL");
        assert!(!b.message.contains("D-PUNE"), "internal detail must not leak");
    }

    #[test]
    fn contention_maps_to_503() {
        let (status, b) = ApiError::Store(StoreError::Contention { attempts: 3 }).status_and_body();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(b.error, "SEQUENCE_CONTENTION");
    }
}
