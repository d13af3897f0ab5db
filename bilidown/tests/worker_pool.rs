//! End-to-end scheduling: the queue, the worker pool and the startup sweep
//! on a real SQLite file, with the network and FFmpeg replaced.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use bilidown::config::SettingsService;
use bilidown::database::Store;
use bilidown::database::models::{
    JobCounts, JobDbModel, JobStatus, NewJobDbModel, TransitionDetail,
};
use bilidown::database::repositories::{
    AuditRepository, JobRepository, SqlxAuditRepository, SqlxJobRepository,
    SqlxSettingRepository,
};
use bilidown::domain::{JobSubmission, VideoFormat};
use bilidown::pipeline::job_queue::INTERRUPTED_REASON;
use bilidown::pipeline::{
    JobQueue, TranscodeOutcome, TranscodeRequest, Transcoder, WorkerPool, WorkerPoolConfig,
};
use bilidown::services::ServiceContainer;
use bilidown::{Error, Result};

use common::{MockFetcher, container, copy_transcoder, files_in, test_config, wait_until_settled};

const SETTLE: Duration = Duration::from_secs(15);

fn submission(bvid: &str, cid: i64) -> JobSubmission {
    JobSubmission::new(bvid, cid, VideoFormat::P1080).with_title(format!("video {bvid}"))
}

#[tokio::test]
async fn single_slot_runs_jobs_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let container = container(&dir, 1).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            container
                .queue
                .enqueue(submission(&format!("BV1fifo{i}"), i + 1))
                .await
                .unwrap(),
        );
    }

    let fetcher = Arc::new(MockFetcher::default());
    container.start_workers(fetcher.clone(), copy_transcoder());

    let counts = wait_until_settled(&container.queue, SETTLE).await;
    assert_eq!(counts.done, 5);
    assert_eq!(fetcher.order(), ids);

    container.shutdown().await;
}

#[tokio::test]
async fn never_more_than_n_jobs_running() {
    let dir = TempDir::new().unwrap();
    let container = container(&dir, 2).await;

    for i in 0..6 {
        container
            .queue
            .enqueue(submission(&format!("BV1cap{i}"), i + 1))
            .await
            .unwrap();
    }

    let fetcher = Arc::new(MockFetcher::with_delay(Duration::from_millis(150)));
    container.start_workers(fetcher.clone(), copy_transcoder());

    let deadline = std::time::Instant::now() + SETTLE;
    loop {
        let counts = container.queue.counts().await.unwrap();
        assert!(counts.running <= 2, "too many running jobs: {counts:?}");
        assert!(container.worker_pool.active_count() <= 2);
        if counts.done == 6 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(fetcher.max_concurrent.load(Ordering::SeqCst), 2);
    container.shutdown().await;
}

#[tokio::test]
async fn successful_job_leaves_exactly_one_output() {
    let dir = TempDir::new().unwrap();
    let container = container(&dir, 1).await;
    let id = container
        .queue
        .enqueue(submission("BV1done", 7))
        .await
        .unwrap();

    container.start_workers(Arc::new(MockFetcher::default()), copy_transcoder());
    wait_until_settled(&container.queue, SETTLE).await;

    let job = container.queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.error.is_none());

    let files = files_in(&job.folder);
    assert_eq!(files.len(), 1, "unexpected files: {files:?}");
    assert_eq!(
        files[0].file_name().unwrap().to_string_lossy(),
        "video BV1done [BV1done-7].mp4"
    );
    assert_eq!(job.output_path.as_deref(), Some(&*files[0].to_string_lossy()));
    assert!(std::fs::metadata(&files[0]).unwrap().len() > 0);

    container.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn transcoder_exit_code_one_fails_job_without_output() {
    use bilidown::pipeline::FfmpegTranscoder;
    use bilidown::pipeline::transcode::locate_executable_in;

    // `false` ignores its arguments and exits with 1.
    let path_var = std::env::var_os("PATH");
    let exe = locate_executable_in(
        "false",
        None,
        std::path::Path::new("/nonexistent"),
        path_var.as_deref(),
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let container = container(&dir, 1).await;
    let id = container
        .queue
        .enqueue(submission("BV1fail", 3))
        .await
        .unwrap();

    container.start_workers(
        Arc::new(MockFetcher::default()),
        Arc::new(FfmpegTranscoder::new(exe)),
    );
    wait_until_settled(&container.queue, SETTLE).await;

    let job = container.queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(
        job.error.as_deref().unwrap_or_default().contains("exited with 1"),
        "unexpected error text: {:?}",
        job.error
    );
    assert!(job.output_path.is_none());
    assert!(files_in(&job.folder).is_empty(), "{:?}", files_in(&job.folder));

    container.shutdown().await;
}

#[tokio::test]
async fn missing_transcoder_aborts_startup_and_keeps_jobs_waiting() {
    let dir = TempDir::new().unwrap();
    let id = {
        let container = container(&dir, 1).await;
        let id = container
            .queue
            .enqueue(submission("BV1xx", 1))
            .await
            .unwrap();
        container.shutdown().await;
        id
    };

    let config = bilidown::config::AppConfig {
        ffmpeg_path: Some(dir.path().join("missing").join("ffmpeg")),
        ..test_config(&dir, 1)
    };
    let result = ServiceContainer::bootstrap(&config).await;
    assert!(matches!(result, Err(Error::ExecutableNotFound { .. })));

    let store = Store::open_file(&common::db_path(&dir)).await.unwrap();
    let job = SqlxJobRepository::new(store.clone()).get_job(id).await.unwrap();
    assert_eq!(job.status, "waiting");
    store.close().await;
}

#[tokio::test]
async fn restart_fails_jobs_left_in_flight() {
    let dir = TempDir::new().unwrap();
    let (waiting, running) = {
        let container = container(&dir, 1).await;
        let running = container
            .queue
            .enqueue(submission("BV1run", 1))
            .await
            .unwrap();
        let waiting = container
            .queue
            .enqueue(submission("BV1wait", 2))
            .await
            .unwrap();
        let claimed = container.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, running);
        // Simulated crash: nothing marks the claimed job.
        container.store.close().await;
        (waiting, running)
    };

    let container = container(&dir, 1).await;
    assert_eq!(container.recovered_jobs(), 2);
    for id in [waiting, running] {
        let job = container.queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_REASON));
    }

    let audit = SqlxAuditRepository::new(container.store.clone())
        .list_recent(10)
        .await
        .unwrap();
    assert!(audit.iter().any(|e| e.content.starts_with("recovery:")));

    // Nothing left for a worker to pick up.
    assert!(container.queue.dequeue().await.unwrap().is_none());
    container.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_running_job_for_next_sweep() {
    let dir = TempDir::new().unwrap();
    let id = {
        let container = container(&dir, 1).await;
        let id = container
            .queue
            .enqueue(submission("BV1stop", 1))
            .await
            .unwrap();
        let fetcher = Arc::new(MockFetcher::hanging());
        container.start_workers(fetcher.clone(), copy_transcoder());

        while fetcher.order().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        container.shutdown().await;
        id
    };

    let store = Store::open_file(&common::db_path(&dir)).await.unwrap();
    let job = SqlxJobRepository::new(store.clone()).get_job(id).await.unwrap();
    assert_eq!(job.status, "running");
    store.close().await;

    let container = container(&dir, 1).await;
    assert_eq!(container.recovered_jobs(), 1);
    assert_eq!(
        container.queue.get_job(id).await.unwrap().status,
        JobStatus::Error
    );
    container.shutdown().await;
}

#[tokio::test]
async fn slow_job_times_out() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_file(&common::db_path(&dir)).await.unwrap();
    let config = bilidown::config::AppConfig {
        job_timeout_secs: 1,
        ..test_config(&dir, 1)
    };
    let container = ServiceContainer::new(&config, store).await.unwrap();
    let id = container
        .queue
        .enqueue(submission("BV1slow", 1))
        .await
        .unwrap();

    container.start_workers(
        Arc::new(MockFetcher::with_delay(Duration::from_secs(5))),
        copy_transcoder(),
    );
    wait_until_settled(&container.queue, SETTLE).await;

    let job = container.queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.unwrap().contains("timed out"));
    assert!(files_in(&job.folder).is_empty());
    container.shutdown().await;
}

#[tokio::test]
async fn canceled_job_is_never_started() {
    let dir = TempDir::new().unwrap();
    let container = container(&dir, 1).await;
    let keep = container
        .queue
        .enqueue(submission("BV1keep", 1))
        .await
        .unwrap();
    let dropped = container
        .queue
        .enqueue(submission("BV1drop", 2))
        .await
        .unwrap();
    container.queue.cancel_job(dropped).await.unwrap();

    let fetcher = Arc::new(MockFetcher::default());
    container.start_workers(fetcher.clone(), copy_transcoder());
    let counts = wait_until_settled(&container.queue, SETTLE).await;

    assert_eq!(counts.done, 1);
    assert_eq!(counts.canceled, 1);
    assert_eq!(fetcher.order(), vec![keep]);
    container.shutdown().await;
}

/// Writes part of the output, then never returns.
#[derive(Default)]
struct StallingTranscoder {
    output: parking_lot::Mutex<Option<PathBuf>>,
}

#[async_trait]
impl Transcoder for StallingTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        _cancel: &CancellationToken,
    ) -> TranscodeOutcome {
        tokio::fs::write(&request.output, b"\x00\x00\x00\x18ftypisom")
            .await
            .unwrap();
        *self.output.lock() = Some(request.output.clone());
        std::future::pending::<TranscodeOutcome>().await
    }
}

#[test]
fn crash_mid_transcode_leaves_nothing_under_the_final_name() {
    let dir = TempDir::new().unwrap();
    let transcoder = Arc::new(StallingTranscoder::default());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (crashed, id, folder) = runtime.block_on(async {
        let container = container(&dir, 1).await;
        let id = container
            .queue
            .enqueue(submission("BV1crash", 1))
            .await
            .unwrap();
        container.start_workers(Arc::new(MockFetcher::default()), transcoder.clone());

        let deadline = Instant::now() + SETTLE;
        let partial = loop {
            if let Some(path) = transcoder.output.lock().clone() {
                break path;
            }
            assert!(Instant::now() < deadline, "transcoder never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        // Mid-transcode the folder holds only the job's scratch directory.
        let folder = container.queue.get_job(id).await.unwrap().folder;
        let entries = files_in(&folder);
        assert_eq!(entries.len(), 1, "unexpected entries: {entries:?}");
        assert!(
            entries[0]
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(".bilidown-")
        );
        assert!(partial.starts_with(&entries[0]));

        container.store.close().await;
        (container, id, folder)
    });
    // No graceful shutdown: the slot is dropped mid-job.
    std::mem::forget(crashed);
    runtime.shutdown_background();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let container = container(&dir, 1).await;
        assert_eq!(container.recovered_jobs(), 1);

        let job = container.queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.output_path.is_none());
        assert!(files_in(&folder).is_empty(), "{:?}", files_in(&folder));
        container.shutdown().await;
    });
}

#[tokio::test]
async fn restart_removes_scratch_dirs_left_by_a_crash() {
    let dir = TempDir::new().unwrap();
    let downloads = dir.path().join("downloads");
    let elsewhere = dir.path().join("elsewhere");

    let id = {
        let container = container(&dir, 1).await;
        container
            .settings
            .set_current_folder(&elsewhere.to_string_lossy())
            .await
            .unwrap();
        let id = container
            .queue
            .enqueue(submission("BV1old", 1))
            .await
            .unwrap();
        container.queue.dequeue().await.unwrap().unwrap();
        container
            .settings
            .set_current_folder(&downloads.to_string_lossy())
            .await
            .unwrap();
        container.store.close().await;
        id
    };

    // What a killed process leaves behind.
    let running_scratch = elsewhere.join(format!(".bilidown-{id}-k3y9"));
    std::fs::create_dir_all(&running_scratch).unwrap();
    std::fs::write(running_scratch.join("output.mp4"), b"partial").unwrap();
    let old_scratch = downloads.join(".bilidown-41-x8q2");
    std::fs::create_dir_all(&old_scratch).unwrap();
    std::fs::write(old_scratch.join("video.m4s"), b"partial").unwrap();
    std::fs::write(downloads.join("finished [BV1x-1].mp4"), b"video").unwrap();

    let container = container(&dir, 1).await;
    assert_eq!(container.recovered_jobs(), 1);
    assert!(files_in(&elsewhere).is_empty(), "{:?}", files_in(&elsewhere));
    assert_eq!(
        files_in(&downloads),
        vec![downloads.join("finished [BV1x-1].mp4")]
    );
    container.shutdown().await;
}

/// Job repository whose transitions out of `running` can be made to fail.
struct FlakyJobRepository {
    inner: SqlxJobRepository,
    /// Every transition to `done` fails.
    reject_done: bool,
    /// Transitions out of `running` that fail before the rest go through.
    failures_left: AtomicUsize,
    rejected: AtomicUsize,
}

impl FlakyJobRepository {
    fn new(store: Store, reject_done: bool, failures: usize) -> Self {
        Self {
            inner: SqlxJobRepository::new(store),
            reject_done,
            failures_left: AtomicUsize::new(failures),
            rejected: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobRepository for FlakyJobRepository {
    async fn get_job(&self, id: i64) -> Result<JobDbModel> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobDbModel>> {
        self.inner.list_jobs(status, limit).await
    }

    async fn count_jobs_by_status(&self) -> Result<JobCounts> {
        self.inner.count_jobs_by_status().await
    }

    async fn create_job(&self, job: &NewJobDbModel) -> Result<JobDbModel> {
        self.inner.create_job(job).await
    }

    async fn claim_next_waiting_job(&self) -> Result<Option<JobDbModel>> {
        self.inner.claim_next_waiting_job().await
    }

    async fn transition(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        detail: TransitionDetail,
    ) -> Result<bool> {
        if from == JobStatus::Running {
            let fail = (self.reject_done && to == JobStatus::Done)
                || self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Other("disk I/O error".to_string()));
            }
        }
        self.inner.transition(id, from, to, detail).await
    }

    async fn fail_in_flight_jobs(&self, reason: &str) -> Result<u64> {
        self.inner.fail_in_flight_jobs(reason).await
    }
}

/// A queue over `jobs` and an idle single-slot pool.
fn flaky_pool(
    dir: &TempDir,
    jobs: Arc<FlakyJobRepository>,
    store: Store,
) -> (Arc<JobQueue>, WorkerPool) {
    let audit = Arc::new(SqlxAuditRepository::new(store.clone()));
    let settings = Arc::new(SettingsService::new(
        Arc::new(SqlxSettingRepository::new(store)),
        audit.clone(),
        dir.path().join("downloads"),
    ));
    let queue = Arc::new(JobQueue::new(jobs, audit, settings));

    let pool = WorkerPool::new(WorkerPoolConfig {
        max_workers: 1,
        job_timeout_secs: 30,
        poll_interval_ms: 50,
    });
    (queue, pool)
}

#[tokio::test]
async fn unrecorded_completion_fails_job_and_removes_output() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_file(&common::db_path(&dir)).await.unwrap();
    store.init_schema().await.unwrap();
    let jobs = Arc::new(FlakyJobRepository::new(store.clone(), true, 0));
    let (queue, pool) = flaky_pool(&dir, jobs.clone(), store.clone());

    let id = queue.enqueue(submission("BV1lost", 1)).await.unwrap();
    pool.start(queue.clone(), Arc::new(MockFetcher::default()), copy_transcoder());
    wait_until_settled(&queue, SETTLE).await;

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(
        job.error
            .as_deref()
            .unwrap_or_default()
            .contains("failed to record completion"),
        "unexpected error text: {:?}",
        job.error
    );
    assert!(job.output_path.is_none());
    assert!(files_in(&job.folder).is_empty(), "{:?}", files_in(&job.folder));
    assert_eq!(jobs.rejected.load(Ordering::SeqCst), 1);

    pool.stop().await;
    store.close().await;
}

#[tokio::test]
async fn slot_holds_its_job_until_the_result_is_recorded() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_file(&common::db_path(&dir)).await.unwrap();
    store.init_schema().await.unwrap();
    // Completion of the first job fails, then two attempts to fail it.
    let jobs = Arc::new(FlakyJobRepository::new(store.clone(), false, 3));
    let (queue, pool) = flaky_pool(&dir, jobs.clone(), store.clone());

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            queue
                .enqueue(submission(&format!("BV1slot{i}"), i + 1))
                .await
                .unwrap(),
        );
    }
    pool.start(queue.clone(), Arc::new(MockFetcher::default()), copy_transcoder());

    let deadline = Instant::now() + SETTLE;
    loop {
        let counts = queue.counts().await.unwrap();
        assert!(counts.running <= 1, "slot moved on early: {counts:?}");
        if counts.waiting == 0 && counts.running == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not settle: {counts:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(jobs.rejected.load(Ordering::SeqCst), 3);
    let first = queue.get_job(ids[0]).await.unwrap();
    assert_eq!(first.status, JobStatus::Error);
    for id in &ids[1..] {
        assert_eq!(queue.get_job(*id).await.unwrap().status, JobStatus::Done);
    }
    assert_eq!(files_in(&first.folder).len(), 2);

    pool.stop().await;
    store.close().await;
}
