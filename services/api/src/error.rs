//! Error taxonomy for the API surface.
//!
//! Every failure path returns a JSON body with `ok: false` and a
//! human-readable `error` string. Row-level validation failures additionally
//! carry `validation_errors` (truncated) plus the untruncated `error_count`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// How many row errors are stored on a mapping.
pub const ROW_ERROR_STORE_CAP: usize = 200;
/// How many row errors are echoed back in a 400 response.
pub const ROW_ERROR_RESPONSE_CAP: usize = 50;

/// One row-level validation failure, keyed by the original 1-based file line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowError {
    pub row_num: i64,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input: bad payload, missing columns, dataset mismatch.
    #[error("{0}")]
    BadRequest(String),

    /// Referenced upload/mapping does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Missing or invalid credentials/session.
    #[error("{0}")]
    Unauthorized(String),

    /// The request conflicts with existing state (e.g. duplicate email).
    #[error("{0}")]
    Conflict(String),

    /// Per-row validation failed; promotion was aborted with no writes.
    #[error("Validation failed")]
    Validation { errors: Vec<RowError>, total: usize },

    /// Store-level failure (connection, query, transaction).
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": msg })),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "error": msg })),
            )
                .into_response(),
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "ok": false, "error": msg })),
            )
                .into_response(),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                Json(json!({ "ok": false, "error": msg })),
            )
                .into_response(),
            ApiError::Validation { errors, total } => {
                let shown: Vec<&RowError> =
                    errors.iter().take(ROW_ERROR_RESPONSE_CAP).collect();
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "ok": false,
                        "error": "Validation failed",
                        "validation_errors": shown,
                        "error_count": total,
                    })),
                )
                    .into_response()
            }
            ApiError::Db(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "ok": false, "error": e.to_string() })),
                )
                    .into_response()
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "ok": false, "error": e.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn row_errors(n: i64) -> Vec<RowError> {
        (0..n)
            .map(|i| RowError {
                row_num: i + 2,
                error: "Invalid date".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn validation_response_truncates_errors_but_keeps_total() {
        let err = ApiError::Validation {
            errors: row_errors(120),
            total: 120,
        };

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error_count"], json!(120));
        let shown = body["validation_errors"].as_array().unwrap();
        assert_eq!(shown.len(), ROW_ERROR_RESPONSE_CAP);
        assert_eq!(shown[0]["row_num"], json!(2));
    }

    #[tokio::test]
    async fn small_validation_batches_are_returned_whole() {
        let err = ApiError::Validation {
            errors: row_errors(3),
            total: 3,
        };
        let response = err.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["validation_errors"].as_array().unwrap().len(), 3);
        assert_eq!(body["error_count"], json!(3));
    }

    #[test]
    fn row_error_round_trips_as_json() {
        let e = RowError {
            row_num: 3,
            error: "Invalid date in column \"day\"".to_string(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["row_num"], 3);
        let back: RowError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }
}
