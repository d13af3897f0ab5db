//! Health check route.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::database::models::JobCounts;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Slots currently executing a job.
    pub active_workers: usize,
    pub tasks: JobCounts,
}

/// Reports `ok` as long as the database answers.
async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let tasks = state.queue.counts().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_workers: state.workers.as_ref().map_or(0, |w| w.active_count()),
        tasks,
    }))
}
