use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::registry::{JobFilter, Pagination, SortOrder};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub max_workers: usize,
    pub version: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let uptime = state.start_time.elapsed().as_secs();
    let active_jobs = state.coordinator.active_count().await;

    // A failing store still answers the health check, with status "degraded".
    let (status, total_jobs) = match state
        .registry
        .list(&JobFilter::default(), SortOrder::Newest, Pagination::default())
        .await
    {
        Ok((_, total)) => ("ok", total),
        Err(e) => {
            tracing::warn!("Health check could not list jobs: {}", e);
            ("degraded", 0)
        }
    };

    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let response = HealthResponse {
        status: status.to_string(),
        uptime_seconds: uptime,
        active_jobs,
        total_jobs,
        max_workers: state.config.max_workers,
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir,
    };

    (StatusCode::OK, Json(response))
}
