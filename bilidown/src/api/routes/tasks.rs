//! Task routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::JobStatus;
use crate::domain::JobSubmission;
use crate::pipeline::Job;

/// Page size when the client does not ask for one.
const DEFAULT_LIST_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/{id}", get(get_task))
        .route("/{id}/cancel", post(cancel_task))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedTask {
    pub id: i64,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            JobStatus::parse(s)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{}'", s)))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.queue.list_jobs(status, limit).await?))
}

async fn create_task(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmission>,
) -> ApiResult<(StatusCode, Json<CreatedTask>)> {
    let id = state.queue.enqueue(submission).await?;
    Ok((StatusCode::CREATED, Json(CreatedTask { id })))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.get_job(id).await?))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.cancel_job(id).await?))
}
