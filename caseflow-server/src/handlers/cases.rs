//! Case handlers.
//!
//! GET  /api/cases/:id                        - snapshot plus stored results
//! POST /api/cases/:id/stages/:stage/advance  - conditional stage advance
//! PUT  /api/cases/:id/stages/:stage/draft    - save result content, no status change
//! POST /api/cases/:id/xray/upload            - record an uploaded radiograph
//! POST /api/cases/:id/doctor                 - admin: pin the case to a physician

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use caseflow_core::{
    AdvanceRequest, CaseSnapshot, CoordinatorError, ResultRecord, Stage, StageResult, StageStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WriteResponse;
use crate::error::AppError;
use crate::identity::Identity;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CaseView {
    pub snapshot: CaseSnapshot,
    pub results: BTreeMap<Stage, ResultRecord>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceBody {
    pub status: StageStatus,
    #[serde(default)]
    pub payload: Option<StageResult>,
    pub expected_version: u64,
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub artifact_key: String,
    pub expected_version: u64,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub doctor_id: Uuid,
    pub expected_version: u64,
}

fn parse_stage(raw: &str) -> Result<Stage, AppError> {
    raw.parse().map_err(AppError::BadRequest)
}

pub async fn get_case(
    State(state): State<AppState>,
    Identity(_caller): Identity,
    Path(case_id): Path<Uuid>,
) -> Result<Json<CaseView>, AppError> {
    let snapshot = state.coordinator.load_case(case_id).await?;
    let mut results = BTreeMap::new();
    for stage in Stage::ALL {
        let record = state
            .coordinator
            .store()
            .load_result(case_id, stage)
            .await
            .map_err(CoordinatorError::from)?;
        if let Some(record) = record {
            results.insert(stage, record);
        }
    }
    Ok(Json(CaseView { snapshot, results }))
}

pub async fn advance(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path((case_id, stage)): Path<(Uuid, String)>,
    Json(body): Json<AdvanceBody>,
) -> Result<Json<WriteResponse>, AppError> {
    let stage = parse_stage(&stage)?;
    if let Some(payload) = &body.payload {
        if payload.stage() != stage {
            return Err(AppError::BadRequest(format!(
                "payload is for {}, route is for {stage}",
                payload.stage()
            )));
        }
    }

    let receipt = state
        .coordinator
        .advance_stage(
            &caller,
            AdvanceRequest {
                case_id,
                stage,
                status: body.status,
                payload: body.payload,
                expected_version: body.expected_version,
            },
        )
        .await?;
    Ok(Json(receipt.into()))
}

pub async fn save_draft(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path((case_id, stage)): Path<(Uuid, String)>,
    Json(payload): Json<StageResult>,
) -> Result<StatusCode, AppError> {
    let stage = parse_stage(&stage)?;
    if payload.stage() != stage {
        return Err(AppError::BadRequest(format!(
            "payload is for {}, route is for {stage}",
            payload.stage()
        )));
    }

    state
        .coordinator
        .save_draft_result(&caller, case_id, payload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_xray_upload(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(case_id): Path<Uuid>,
    Json(body): Json<UploadBody>,
) -> Result<Json<WriteResponse>, AppError> {
    let receipt = state
        .coordinator
        .record_xray_upload(&caller, case_id, body.artifact_key, body.expected_version)
        .await?;
    Ok(Json(receipt.into()))
}

pub async fn assign_doctor(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(case_id): Path<Uuid>,
    Json(body): Json<AssignBody>,
) -> Result<Json<WriteResponse>, AppError> {
    let receipt = state
        .coordinator
        .assign_doctor(&caller, case_id, body.doctor_id, body.expected_version)
        .await?;
    Ok(Json(receipt.into()))
}
