//! Download folder and session cookie routes.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_folder).put(set_folder))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FolderBody {
    pub folder: String,
}

async fn get_folder(State(state): State<AppState>) -> ApiResult<Json<FolderBody>> {
    let folder = state.settings.current_folder().await?;
    Ok(Json(FolderBody { folder }))
}

async fn set_folder(
    State(state): State<AppState>,
    Json(body): Json<FolderBody>,
) -> ApiResult<Json<FolderBody>> {
    let folder = state.settings.set_current_folder(&body.folder).await?;
    Ok(Json(FolderBody { folder }))
}

/// Session cookie routes. The cookie itself is write-only.
pub fn session_router() -> Router<AppState> {
    Router::new().route("/", get(get_session).put(set_session))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub logged_in: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    pub sessdata: Option<String>,
}

async fn get_session(State(state): State<AppState>) -> ApiResult<Json<SessionStatus>> {
    let logged_in = state.settings.sessdata().await?.is_some();
    Ok(Json(SessionStatus { logged_in }))
}

async fn set_session(
    State(state): State<AppState>,
    Json(body): Json<SessionBody>,
) -> ApiResult<Json<SessionStatus>> {
    let sessdata = body.sessdata.as_deref().map(str::trim);
    state.settings.set_sessdata(sessdata).await?;
    Ok(Json(SessionStatus {
        logged_in: sessdata.is_some_and(|s| !s.is_empty()),
    }))
}
