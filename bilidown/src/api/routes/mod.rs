//! API route modules.
//!
//! Organizes routes by resource type.

pub mod health;
pub mod logs;
pub mod settings;
pub mod tasks;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/tasks", tasks::router())
        .nest("/api/folder", settings::router())
        .nest("/api/session", settings::session_router())
        .nest("/api/logs", logs::router())
        .nest("/api/logging", logs::filter_router())
        .nest("/health", health::router())
        .with_state(state)
}
