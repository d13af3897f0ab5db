//! Worker pool.
//!
//! A fixed number of slots, each a tokio task that owns at most one job at a
//! time. A slot claims work through [`JobQueue::dequeue`], so the database
//! decides who gets which job; fetching and transcoding run outside the
//! write gate, and only the status updates go through it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::fetcher::Fetcher;
use super::job_queue::{Job, JobQueue};
use super::transcode::{TranscodeRequest, Transcoder};
use crate::config::app::{DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_WORKERS};
use crate::database::retry::retry_on_sqlite_busy;
use crate::utils::filename::output_file_name;
use crate::utils::fs::{
    SCRATCH_DIR_PREFIX, ensure_dir_all, is_non_empty_file, remove_file_quietly,
};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent slots.
    pub max_workers: usize,
    /// Upper bound on one job, fetch and transcode included.
    pub job_timeout_secs: u64,
    /// Fallback poll interval when no enqueue notification arrives.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_WORKERS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Give up looking for a free output name after this many candidates.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Transcoder output inside the scratch directory, before publishing.
const STAGED_OUTPUT_NAME: &str = "output.mp4";

/// Final state of one job run, before it is persisted.
#[derive(Debug)]
enum JobRun {
    Finished(PathBuf),
    Failed(String),
    /// Shutdown interrupted the job; it stays `running` for the next
    /// startup sweep.
    Interrupted,
}

/// Everything a slot needs, shared by all slots.
struct SlotContext {
    queue: Arc<JobQueue>,
    fetcher: Arc<dyn Fetcher>,
    transcoder: Arc<dyn Transcoder>,
    job_timeout: Duration,
    poll_interval: Duration,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// A worker pool for processing jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Slots currently executing a job.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the slots. The startup sweep must have run already.
    pub fn start(
        &self,
        queue: Arc<JobQueue>,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
    ) {
        let ctx = Arc::new(SlotContext {
            queue,
            fetcher,
            transcoder,
            job_timeout: Duration::from_secs(self.config.job_timeout_secs),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            active: self.active_workers.clone(),
            cancel: self.cancellation_token.clone(),
        });

        info!(workers = self.config.max_workers, "Starting worker pool");

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for slot in 0..self.config.max_workers {
                let ctx = ctx.clone();
                join_set.spawn(run_slot(slot, ctx).instrument(info_span!("worker", slot)));
            }
        }
    }

    /// Cancel every slot and wait for them to exit.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result
                    && e.is_panic()
                {
                    error!(error = %e, "Worker slot panicked");
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Number of slots currently executing a job.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

async fn run_slot(slot: usize, ctx: Arc<SlotContext>) {
    debug!("Worker {} started", slot);
    let notifier = ctx.queue.notifier();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // Drain: a slot that just finished a job looks for the next one
        // before it goes back to sleep.
        match ctx.queue.dequeue().await {
            Ok(Some(job)) => {
                run_claimed_job(&ctx, job).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Error dequeuing job"),
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = notifier.notified() => {}
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }
    }

    debug!("Worker {} shutting down", slot);
}

async fn run_claimed_job(ctx: &SlotContext, job: Job) {
    let job_id = job.id;
    ctx.active.fetch_add(1, Ordering::SeqCst);
    info!(job_id, bvid = %job.bvid, "Processing job");

    let run = execute_job(ctx, &job)
        .instrument(info_span!("job", id = job_id))
        .await;

    match run {
        JobRun::Finished(output) => {
            let queue = &ctx.queue;
            let path = output.to_string_lossy();
            let path: &str = &path;
            if let Err(e) =
                retry_on_sqlite_busy("complete_job", move || queue.complete(job_id, path)).await
            {
                error!(job_id, error = %e, "Failed to record completed job");
                remove_file_quietly(&output).await;
                record_failure(ctx, job_id, &format!("failed to record completion: {e}")).await;
            }
        }
        JobRun::Failed(reason) => record_failure(ctx, job_id, &reason).await,
        JobRun::Interrupted => info!(job_id, "Job interrupted by shutdown"),
    }

    ctx.active.fetch_sub(1, Ordering::SeqCst);
}

/// Move a running job to `error`, retrying until the write lands.
///
/// The slot stays busy meanwhile, so a job whose row is still `running`
/// keeps its slot. Shutdown gives up and leaves the row to the startup sweep.
async fn record_failure(ctx: &SlotContext, job_id: i64, reason: &str) {
    let queue = &ctx.queue;
    loop {
        match retry_on_sqlite_busy("fail_job", move || queue.fail(job_id, reason)).await {
            Ok(()) => return,
            Err(e) => error!(job_id, error = %e, "Failed to record job failure"),
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                warn!(job_id, "Shutdown before the failure was recorded");
                return;
            }
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }
    }
}

/// Fetch, transcode, verify and publish one job.
///
/// Everything is written inside a per-job scratch directory (a `TempDir`,
/// removed on every path). Only a verified output is renamed into the
/// download folder, so the final name never holds a partial file.
async fn execute_job(ctx: &SlotContext, job: &Job) -> JobRun {
    if let Err(e) = ensure_dir_all(&job.folder).await {
        return JobRun::Failed(e.to_string());
    }

    let scratch = match tempfile::Builder::new()
        .prefix(&format!("{SCRATCH_DIR_PREFIX}{}-", job.id))
        .tempdir_in(&job.folder)
    {
        Ok(dir) => dir,
        Err(e) => return JobRun::Failed(format!("failed to create work directory: {e}")),
    };
    let staged = scratch.path().join(STAGED_OUTPUT_NAME);

    let pipeline = fetch_and_transcode(ctx, job, scratch.path(), &staged);
    let run = tokio::select! {
        _ = ctx.cancel.cancelled() => JobRun::Interrupted,
        result = tokio::time::timeout(ctx.job_timeout, pipeline) => match result {
            Ok(run) => run,
            Err(_) => JobRun::Failed(format!(
                "job timed out after {}s",
                ctx.job_timeout.as_secs()
            )),
        },
    };

    let run = match run {
        JobRun::Finished(staged) => {
            let name = output_file_name(&job.title, &job.bvid, job.cid);
            match publish_output(&staged, &job.folder, &name).await {
                Ok(output) => JobRun::Finished(output),
                Err(e) => JobRun::Failed(format!("failed to publish output: {e}")),
            }
        }
        other => other,
    };
    drop(scratch);
    run
}

async fn fetch_and_transcode(
    ctx: &SlotContext,
    job: &Job,
    work_dir: &Path,
    output: &Path,
) -> JobRun {
    let media = match ctx.fetcher.fetch(job, work_dir, &ctx.cancel).await {
        Ok(media) if media.inputs.is_empty() => {
            return JobRun::Failed("fetcher returned no media".to_string());
        }
        Ok(media) => media,
        Err(_) if ctx.cancel.is_cancelled() => return JobRun::Interrupted,
        Err(e) => return JobRun::Failed(e.to_string()),
    };

    let request = TranscodeRequest {
        inputs: media.inputs,
        output: output.to_path_buf(),
        timeout: ctx.job_timeout,
    };
    let outcome = ctx.transcoder.transcode(&request, &ctx.cancel).await;
    if !outcome.is_success() {
        if ctx.cancel.is_cancelled() {
            return JobRun::Interrupted;
        }
        return JobRun::Failed(outcome.describe());
    }

    if !is_non_empty_file(output).await {
        return JobRun::Failed(
            "transcoder reported success but the output is missing or empty".to_string(),
        );
    }
    JobRun::Finished(output.to_path_buf())
}

/// Move a verified `staged` file to a free name in `folder`.
async fn publish_output(
    staged: &Path,
    folder: &Path,
    file_name: &str,
) -> std::io::Result<PathBuf> {
    let output = reserve_output_path(folder, file_name)?;
    if let Err(e) = tokio::fs::rename(staged, &output).await {
        remove_file_quietly(&output).await;
        return Err(e);
    }
    Ok(output)
}

/// Reserve `folder/name`, or `folder/stem (n).ext` for the first free `n`
/// when the name is taken, by creating an empty placeholder. Concurrent jobs
/// for the same video never share an output path.
fn reserve_output_path(folder: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (file_name, String::new()),
    };

    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = if n == 0 {
            folder.join(file_name)
        } else {
            folder.join(format!("{stem} ({n}){ext}"))
        };
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free output name for {file_name}"),
    ))
}
