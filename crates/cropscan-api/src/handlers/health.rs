use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
    pub workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_last_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_error: Option<String>,
}

/// Reports `degraded` with 503 while the broker is unreachable. Uploads are
/// still accepted then; their descriptors are republished later.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.broker_health.status();
    let (status_code, status) = if broker.connected {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            broker_connected: broker.connected,
            workers: state.workers,
            broker_last_checked_at: broker.last_checked_at,
            broker_error: broker.last_error,
        }),
    )
}
