//! Request handlers, grouped by caller.

pub mod admin;
pub mod nodes;
pub mod user;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stratus_core::CoreError;

/// Maps core errors onto HTTP responses.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            CoreError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::TypeMismatch { .. }
            | CoreError::RoundMismatch { .. }
            | CoreError::InProgress => StatusCode::CONFLICT,
            CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
            CoreError::Store(_) => {
                if self.0.is_not_found() {
                    StatusCode::NOT_FOUND
                } else if self.0.is_transient() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// The empty-success body most mutation endpoints return.
#[must_use]
pub fn ok() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}
