//! HTTP adapter.
//!
//! Handlers only translate between JSON and the job queue / settings
//! services; they hold no state of their own.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
