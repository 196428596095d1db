//! API error handling.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<sitedeploy_core::Error> for ApiError {
    fn from(err: sitedeploy_core::Error) -> Self {
        use sitedeploy_core::Error;
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::Unavailable(msg) => ApiError::Unavailable(msg),
            Error::Dispatch(_) | Error::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<sitedeploy_db::DbError> for ApiError {
    fn from(err: sitedeploy_db::DbError) -> Self {
        sitedeploy_core::Error::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
