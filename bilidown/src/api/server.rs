//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::SettingsService;
use crate::database::repositories::AuditRepository;
use crate::logging::LoggingConfig;
use crate::pipeline::{JobQueue, WorkerPool};
use crate::{Error, Result};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub addr: SocketAddr,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl ApiServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            body_limit: 64 * 1024,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub queue: Arc<JobQueue>,
    pub settings: Arc<SettingsService>,
    pub audit: Arc<dyn AuditRepository>,
    /// Absent when the pool is not running (tests, maintenance runs).
    pub workers: Option<Arc<WorkerPool>>,
    /// Absent when no global subscriber was installed by this process.
    pub logging: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(
        queue: Arc<JobQueue>,
        settings: Arc<SettingsService>,
        audit: Arc<dyn AuditRepository>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            queue,
            settings,
            audit,
            workers: None,
            logging: None,
        }
    }

    pub fn with_workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_logging_config(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request| {
                        if req.uri().path() == "/health" {
                            Span::none()
                        } else {
                            let mut make_span = tower_http::trace::DefaultMakeSpan::new()
                                .level(tracing::Level::INFO);
                            use tower_http::trace::MakeSpan;
                            make_span.make_span(req)
                        }
                    })
                    .on_response(
                        |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                            if span.is_disabled() {
                                return;
                            }
                            let on_response = tower_http::trace::DefaultOnResponse::new()
                                .level(tracing::Level::INFO);
                            use tower_http::trace::OnResponse;
                            on_response.on_response(res, latency, span);
                        },
                    ),
            )
    }

    /// Bind and serve until [`ApiServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| Error::Other(format!("Failed to bind {}: {}", self.config.addr, e)))?;

        tracing::info!("API server listening on http://{}", self.config.addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
