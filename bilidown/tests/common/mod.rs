//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use bilidown::config::AppConfig;
use bilidown::database::Store;
use bilidown::database::models::JobCounts;
use bilidown::pipeline::{
    FetchedMedia, Fetcher, Job, JobQueue, TranscodeOutcome, TranscodeRequest, Transcoder,
};
use bilidown::services::ServiceContainer;
use bilidown::{Error, Result};

pub fn test_config(dir: &TempDir, workers: usize) -> AppConfig {
    AppConfig {
        database_url: database_url(&db_path(dir)),
        workers,
        job_timeout_secs: 30,
        poll_interval_ms: 50,
        download_dir: dir.path().join("downloads"),
        log_dir: dir.path().join("logs"),
        ..AppConfig::default()
    }
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("bilidown.db")
}

pub fn database_url(path: &Path) -> String {
    format!("sqlite:{}?mode=rwc", path.to_string_lossy().replace('\\', "/"))
}

/// A container on the temp database, workers not started.
pub async fn container(dir: &TempDir, workers: usize) -> ServiceContainer {
    let store = Store::open_file(&db_path(dir)).await.unwrap();
    ServiceContainer::new(&test_config(dir, workers), store)
        .await
        .unwrap()
}

/// Poll until no job is `waiting` or `running`.
pub async fn wait_until_settled(queue: &JobQueue, timeout: Duration) -> JobCounts {
    let deadline = Instant::now() + timeout;
    loop {
        let counts = queue.counts().await.unwrap();
        if counts.waiting == 0 && counts.running == 0 {
            return counts;
        }
        assert!(
            Instant::now() < deadline,
            "jobs did not settle in time: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Every entry directly under `dir`, files and directories alike, sorted.
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Writes one small input file per job and records what it saw.
#[derive(Default)]
pub struct MockFetcher {
    pub delay: Duration,
    /// Wait for cancellation instead of returning.
    pub hang: bool,
    pub order: parking_lot::Mutex<Vec<i64>>,
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl MockFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn order(&self) -> Vec<i64> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        job: &Job,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedMedia> {
        self.order.lock().push(job.id);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        if self.hang {
            cancel.cancelled().await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::fetch("cancelled"));
        }
        tokio::time::sleep(self.delay).await;

        let input = work_dir.join("video.m4s");
        tokio::fs::write(&input, format!("media for {}", job.bvid))
            .await
            .unwrap();
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(FetchedMedia {
            inputs: vec![input],
        })
    }
}

/// Copies the first input to the output path.
pub struct CopyTranscoder;

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        _cancel: &CancellationToken,
    ) -> TranscodeOutcome {
        match tokio::fs::copy(&request.inputs[0], &request.output).await {
            Ok(_) => TranscodeOutcome::Success {
                output: request.output.clone(),
                exit_code: 0,
                duration: Duration::ZERO,
            },
            Err(e) => TranscodeOutcome::SpawnFailed {
                reason: e.to_string(),
            },
        }
    }
}

pub fn copy_transcoder() -> Arc<dyn Transcoder> {
    Arc::new(CopyTranscoder)
}
