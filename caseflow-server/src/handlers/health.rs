use axum::{extract::State, Json};
use caseflow_core::FanoutStats;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub fanout: FanoutStats,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        fanout: state.fanout.stats(),
    })
}
