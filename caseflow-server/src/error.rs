//! HTTP mapping for coordinator failures.
//!
//! Every error body is `{ "error", "kind", "refresh" }`. `refresh` tells the
//! client its view of the case is out of date and must be re-fetched.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use caseflow_core::CoordinatorError;
use serde::Serialize;

#[derive(Debug)]
pub enum AppError {
    Coordinator(CoordinatorError),
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    pub refresh: bool,
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        Self::Coordinator(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Coordinator(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(error = %err, kind = err.kind(), "request failed");
                }
                (
                    status,
                    ErrorBody {
                        error: err.to_string(),
                        kind: err.kind(),
                        refresh: err.should_refresh(),
                    },
                )
            }
            Self::BadRequest(error) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error,
                    kind: "bad_request",
                    refresh: false,
                },
            ),
            Self::Unauthorized(error) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error,
                    kind: "unauthorized",
                    refresh: false,
                },
            ),
            Self::NotFound(error) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error,
                    kind: "not_found",
                    refresh: false,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}
