//! Service container for dependency injection.
//!
//! The ServiceContainer holds references to all application services
//! and manages their lifecycle. Startup order matters: the transcoder is
//! located before the database is touched, and the recovery sweep finishes
//! before any worker or request handler can see a job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::Result;
use crate::api::{ApiServer, ApiServerConfig, AppState};
use crate::config::{AppConfig, SettingsService};
use crate::database::Store;
use crate::database::repositories::{
    AuditRepository, SqlxAuditRepository, SqlxJobRepository, SqlxSettingRepository,
};
use crate::logging::LoggingConfig;
use crate::pipeline::transcode::locate_executable;
use crate::pipeline::{
    BilibiliFetcher, FfmpegTranscoder, Fetcher, JobQueue, Transcoder, WorkerPool,
    WorkerPoolConfig,
};
use crate::utils::http_client::build_client;

/// Connect timeout for the Bilibili API and CDN.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Name of the transcoder executable, without platform suffix.
pub const TRANSCODER_EXECUTABLE: &str = "ffmpeg";

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database handle (read pool, write pool and write gate).
    pub store: Store,
    pub settings: Arc<SettingsService>,
    pub audit: Arc<dyn AuditRepository>,
    pub queue: Arc<JobQueue>,
    pub worker_pool: Arc<WorkerPool>,
    http_addr: std::net::SocketAddr,
    /// Jobs failed by the startup sweep.
    recovered: u64,
}

impl ServiceContainer {
    /// Full production startup.
    ///
    /// Fails without opening the database when the transcoder cannot be
    /// found, so queued jobs stay `waiting` for the next attempt.
    pub async fn bootstrap(config: &AppConfig) -> Result<Self> {
        let transcoder = Arc::new(FfmpegTranscoder::new(locate_executable(
            TRANSCODER_EXECUTABLE,
            config.ffmpeg_path.as_deref(),
        )?));
        info!(path = %transcoder.executable().display(), "Using transcoder");

        let store = Store::open(&config.database_url).await?;
        let container = Self::new(config, store).await?;

        let client = build_client(HTTP_CONNECT_TIMEOUT)?;
        let fetcher = Arc::new(BilibiliFetcher::new(client, container.settings.clone()));
        container.start_workers(fetcher, transcoder);

        Ok(container)
    }

    /// Build every service on an opened store and run the recovery sweep.
    /// Workers are not started.
    pub async fn new(config: &AppConfig, store: Store) -> Result<Self> {
        info!("Initializing service container");

        store.init_schema().await?;

        let audit: Arc<dyn AuditRepository> = Arc::new(SqlxAuditRepository::new(store.clone()));
        let settings = Arc::new(SettingsService::new(
            Arc::new(SqlxSettingRepository::new(store.clone())),
            audit.clone(),
            config.download_dir.clone(),
        ));
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxJobRepository::new(store.clone())),
            audit.clone(),
            settings.clone(),
        ));

        let folder = settings.current_folder().await?;
        info!(folder = %folder, "Download folder");

        let recovered = queue.recover_jobs().await?;

        let worker_pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            max_workers: config.workers,
            job_timeout_secs: config.job_timeout_secs,
            poll_interval_ms: config.poll_interval_ms,
        }));

        info!("Service container initialized");

        Ok(Self {
            store,
            settings,
            audit,
            queue,
            worker_pool,
            http_addr: config.http_addr,
            recovered,
        })
    }

    /// Start draining the queue.
    pub fn start_workers(&self, fetcher: Arc<dyn Fetcher>, transcoder: Arc<dyn Transcoder>) {
        self.worker_pool
            .start(self.queue.clone(), fetcher, transcoder);
    }

    /// Number of jobs the startup sweep marked as failed.
    pub fn recovered_jobs(&self) -> u64 {
        self.recovered
    }

    /// Shared state for the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState::new(self.queue.clone(), self.settings.clone(), self.audit.clone())
            .with_workers(self.worker_pool.clone())
    }

    /// HTTP server bound to the configured address.
    pub fn api_server(&self, logging: Option<Arc<LoggingConfig>>) -> ApiServer {
        let mut state = self.app_state();
        if let Some(logging) = logging {
            state = state.with_logging_config(logging);
        }
        ApiServer::new(ApiServerConfig::new(self.http_addr), state)
    }

    /// Stop the workers, then close the database.
    ///
    /// Jobs interrupted here stay `running` and are failed by the next
    /// startup's sweep.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.worker_pool.stop().await;

        let counts = match self.queue.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "Failed to read job counts during shutdown");
                None
            }
        };
        if let Some(counts) = counts
            && counts.running > 0
        {
            warn!(
                running = counts.running,
                "Jobs left unfinished; they will be marked as failed on next start"
            );
        }

        self.store.close().await;
        info!("Services shut down");
    }
}
