use axum::{extract::State, response::IntoResponse, Json};
use cropscan_services::{CleanupReport, ReaperStats};
use cropscan_storage::StoreStats;
use serde::Serialize;
use std::sync::Arc;

use crate::error::HttpAppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FileStatsResponse {
    #[serde(flatten)]
    pub store: StoreStats,
    #[serde(flatten)]
    pub reaper: ReaperStats,
}

pub async fn file_stats(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let store = state.files.stats().await;
    let reaper = state.reaper.stats().await;
    Ok(Json(FileStatsResponse { store, reaper }))
}

/// Run a full reaper pass now instead of waiting for the next tick.
#[tracing::instrument(skip(state))]
pub async fn cleanup_files(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let report: CleanupReport = state.reaper.force_cleanup().await;
    tracing::info!(
        deleted_files = report.deleted_files,
        space_reclaimed_bytes = report.space_reclaimed_bytes,
        jobs_reaped = report.jobs_reaped,
        orphans_swept = report.orphans_swept,
        "Manual cleanup finished"
    );
    Ok(Json(report))
}
