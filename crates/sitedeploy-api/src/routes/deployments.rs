//! Deployment job endpoints.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sitedeploy_core::{
    ContentRef, DeploymentJob, DeploymentType, JobId, JobStatus, TriggerSource,
};
use sitedeploy_db::{JobFilter, JobRepo, StatusCounts};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_deployments).post(create_deployment))
        .route("/stats", get(deployment_stats))
        .route("/{id}", get(get_deployment))
        .route("/{id}/retry", post(retry_deployment))
        .route("/{id}/cancel", post(cancel_deployment))
}

#[derive(Debug, Serialize)]
pub(crate) struct JobResponse {
    success: bool,
    job: DeploymentJob,
    /// False when an active job for the same post was returned instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<bool>,
}

impl JobResponse {
    pub(crate) fn new(job: DeploymentJob) -> Self {
        Self {
            success: true,
            job,
            created: None,
        }
    }

    pub(crate) fn inserted(inserted: sitedeploy_db::Inserted) -> (StatusCode, Json<Self>) {
        let status = if inserted.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        let body = Self {
            success: true,
            job: inserted.job,
            created: Some(inserted.created),
        };
        (status, Json(body))
    }
}

#[derive(Debug, Deserialize)]
struct CreateDeploymentRequest {
    post_id: Option<i64>,
    post_slug: Option<String>,
    post_title: Option<String>,
    deployment_type: DeploymentType,
    triggered_by: TriggerSource,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl CreateDeploymentRequest {
    fn content_ref(&self) -> Result<Option<ContentRef>, ApiError> {
        match self.post_id {
            Some(post_id) => Ok(Some(ContentRef {
                post_id,
                post_slug: self.post_slug.clone(),
                post_title: self.post_title.clone(),
            })),
            None if self.post_slug.is_some() || self.post_title.is_some() => Err(
                ApiError::BadRequest("post_slug and post_title require post_id".into()),
            ),
            None => Ok(None),
        }
    }
}

async fn create_deployment(
    State(state): State<AppState>,
    payload: Result<Json<CreateDeploymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let Json(req) = payload?;
    let content = req.content_ref()?;
    let inserted = state
        .intake
        .create(req.triggered_by, req.deployment_type, content, req.metadata)
        .await?;
    Ok(JobResponse::inserted(inserted))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    success: bool,
    job: DeploymentJob,
    duration_seconds: Option<i64>,
}

async fn get_deployment(
    State(state): State<AppState>,
    id: Result<Path<JobId>, PathRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let Path(id) = id?;
    let job = state.repo.get(id).await?;
    let duration_seconds = job.duration_seconds(Utc::now());
    Ok(Json(JobStatusResponse {
        success: true,
        job,
        duration_seconds,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<String>,
    triggered_by: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl ListParams {
    fn into_filter(self) -> Result<JobFilter, ApiError> {
        let status = non_empty(self.status)
            .map(|s| s.parse::<JobStatus>())
            .transpose()?;
        let triggered_by = non_empty(self.triggered_by)
            .map(|s| s.parse::<TriggerSource>())
            .transpose()?;

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ApiError::BadRequest("offset must not be negative".into()));
        }

        Ok(JobFilter {
            status,
            triggered_by,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    success: bool,
    jobs: Vec<DeploymentJob>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn list_deployments(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<JobListResponse>, ApiError> {
    let Query(params) = params?;
    let filter = params.into_filter()?;
    let page = state.repo.list(&filter).await?;
    Ok(Json(JobListResponse {
        success: true,
        jobs: page.jobs,
        total: page.total,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    success: bool,
    counts: StatusCounts,
}

async fn deployment_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.repo.count_by_status().await?;
    Ok(Json(StatsResponse {
        success: true,
        counts,
    }))
}

async fn retry_deployment(
    State(state): State<AppState>,
    id: Result<Path<JobId>, PathRejection>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let Path(id) = id?;
    let inserted = state.operator.retry(id).await?;
    Ok(JobResponse::inserted(inserted))
}

async fn cancel_deployment(
    State(state): State<AppState>,
    id: Result<Path<JobId>, PathRejection>,
) -> Result<Json<JobResponse>, ApiError> {
    let Path(id) = id?;
    let job = state.operator.cancel(id).await?;
    Ok(Json(JobResponse::new(job)))
}
