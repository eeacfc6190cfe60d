//! Appointment handlers.
//!
//! POST  /api/appointments             - book a new case
//! PATCH /api/appointments/:id/status  - admin lifecycle change

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use caseflow_core::{AppointmentStatus, BookingRequest, CaseSnapshot};
use serde::Deserialize;
use uuid::Uuid;

use super::WriteResponse;
use crate::error::AppError;
use crate::identity::Identity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: AppointmentStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub expected_version: u64,
}

pub async fn book(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<CaseSnapshot>), AppError> {
    tracing::debug!(user_id = %caller.user_id, role = %caller.role, "booking appointment");
    let snapshot = state.coordinator.book_appointment(request).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub async fn set_status(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(case_id): Path<Uuid>,
    Json(request): Json<StatusChangeRequest>,
) -> Result<Json<WriteResponse>, AppError> {
    let receipt = state
        .coordinator
        .set_appointment_status(
            &caller,
            case_id,
            request.status,
            request.reason,
            request.expected_version,
        )
        .await?;
    Ok(Json(receipt.into()))
}
