use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use doc_analyser_common::{Job, JobId, JobStatus, JobView, NewJob};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::orchestrator::Orchestrator;
use super::ws::ws_handler;
use crate::errors::{AnalysisError, StoreError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ws_tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let ws_tx = orchestrator.events();
        Self {
            orchestrator,
            ws_tx,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

fn default_include_folders() -> Vec<String> {
    vec!["docs".to_string()]
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_include_folders")]
    pub include_folders: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub data_path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub project_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        match &err {
            AnalysisError::JobNotFound { .. }
            | AnalysisError::ArtifactNotFound { .. }
            | AnalysisError::Store(StoreError::JobNotFound(_)) => ApiError::NotFound(err.to_string()),
            AnalysisError::InvalidRequest(msg) => ApiError::BadRequest(msg.clone()),
            AnalysisError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            AnalysisError::Store(_) | AnalysisError::Other(_) => {
                tracing::error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {raw}")))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/analysis/analyze", post(analyze))
        .route("/analysis/status/{job_id}", get(job_status))
        .route("/analysis/jobs", get(list_jobs))
        .route("/analysis/jobs/{job_id}", delete(delete_job))
        .route("/analysis/jobs/{job_id}/detail", get(job_detail))
        .route("/analysis/jobs/{job_id}/cancel", post(cancel_job))
        .route("/analysis/jobs/{job_id}/files/{filename}", get(job_file))
        .route("/analysis/project/{project_id}/jobs", get(project_jobs))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn analyze(
    State(state): State<SharedState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let job_id = state
        .orchestrator
        .submit(NewJob {
            repository_url: req.url,
            branch: req.branch.unwrap_or_default(),
            include_folders: req.include_folders,
            project_id: req.project_id,
        })
        .await?;
    Ok(Json(AnalyzeResponse {
        job_id,
        status: JobStatus::Pending,
    }))
}

async fn job_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.get_status(id).await?))
}

async fn job_detail(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetail>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state.orchestrator.get_job(id).await?;
    let data_path = state.orchestrator.layout(id).data_dir.display().to_string();
    Ok(Json(JobDetail { job, data_path }))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let jobs = state
        .orchestrator
        .list_jobs(query.project_id.as_deref())
        .await?;
    Ok(Json(jobs.iter().map(Job::view).collect()))
}

async fn project_jobs(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let jobs = state.orchestrator.list_jobs(Some(&project_id)).await?;
    Ok(Json(jobs.iter().map(Job::view).collect()))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.cancel(id).await?))
}

async fn delete_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&job_id)?;
    state.orchestrator.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn job_file(
    State(state): State<SharedState>,
    Path((job_id, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let path = state.orchestrator.artifact_path(id, &filename).await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to read {filename}: {e}")))?;
    let mime = mime_guess::from_path(&path).first_or_text_plain();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}
