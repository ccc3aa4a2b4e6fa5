use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use cropscan_core::{AnalysisType, AppError, Job, JobFailure, JobStatus};
use cropscan_db::CancelOutcome;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::HttpAppError;
use crate::state::AppState;

/// Client view of a job. Queue bookkeeping stays internal.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub analysis_type: AnalysisType,
    pub file_id: String,
    pub attempts: i32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            analysis_type: job.analysis_type,
            file_id: job.stored_file_id,
            attempts: job.attempts,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            result: job.result,
            error: job.error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub message: String,
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::Validation(format!("Invalid job id: {}", raw)))
}

#[tracing::instrument(skip(state))]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let job_id = parse_job_id(&id)?;
    let job = state.jobs.get_status(job_id).await.map_err(AppError::from)?;
    Ok(Json(JobStatusResponse::from(job)))
}

/// Request cooperative cancellation.
///
/// Succeeds for any known job. A job that already finished is left untouched
/// and its terminal status is reported back.
#[tracing::instrument(skip(state))]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let job_id = parse_job_id(&id)?;
    let outcome = state
        .jobs
        .request_cancel(job_id)
        .await
        .map_err(AppError::from)?;

    let message = match &outcome {
        CancelOutcome::Requested(_) => "Cancellation requested",
        CancelOutcome::AlreadyRequested(_) => "Cancellation already requested",
        CancelOutcome::AlreadyTerminal(_) => "Job already finished; nothing to cancel",
    };
    tracing::info!(
        job.id = %job_id,
        noop = outcome.is_noop(),
        outcome = message,
        "Cancel request handled"
    );

    let job = outcome.job();
    Ok(Json(CancelResponse {
        job_id,
        status: job.status,
        cancel_requested: job.cancel_requested,
        message: message.to_string(),
    }))
}
