//! Scheduled processing trigger.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use sitedeploy_scheduler::TickReport;

use crate::AppState;
use crate::auth::CronAuth;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/process", post(process))
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    success: bool,
    #[serde(flatten)]
    report: TickReport,
}

/// Sweep timed-out jobs, then claim and dispatch pending ones.
async fn process(
    _auth: CronAuth,
    State(state): State<AppState>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let report = state.worker.tick().await?;
    Ok(Json(ProcessResponse {
        success: true,
        report,
    }))
}
