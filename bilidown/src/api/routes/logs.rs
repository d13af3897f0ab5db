//! Audit log and log filter routes.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::AuditEntryDbModel;

const DEFAULT_LOG_LIMIT: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_logs))
}

pub fn filter_router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(set_filter))
}

#[derive(Debug, Deserialize)]
pub struct ListLogsQuery {
    pub limit: Option<i64>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<ListLogsQuery>,
) -> ApiResult<Json<Vec<AuditEntryDbModel>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(state.audit.list_recent(limit).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilterBody {
    pub filter: String,
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}

async fn set_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilterBody>,
) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    logging.set_filter(&body.filter)?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}
