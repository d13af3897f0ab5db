//! Database-backed job queue.
//!
//! The `task` table is the queue: there is no in-memory copy to drift out of
//! sync. Workers are woken through a [`Notify`] when a job is enqueued and
//! also poll, so a missed wakeup only costs one poll interval.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::SettingsService;
use crate::database::models::{
    JobCounts, JobDbModel, JobStatus, NewJobDbModel, TransitionDetail,
};
use crate::database::repositories::{AuditRepository, JobRepository};
use crate::database::time::ms_to_datetime;
use crate::domain::{JobSubmission, VideoFormat};
use crate::utils::fs::remove_scratch_dirs;
use crate::{Error, Result};

/// Error text recorded on jobs failed by the startup sweep.
pub const INTERRUPTED_REASON: &str = "interrupted: the previous run ended before this job finished";

/// A job as seen by the scheduler and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: i64,
    pub bvid: String,
    pub cid: i64,
    pub format: VideoFormat,
    pub title: String,
    pub owner: String,
    pub cover: String,
    pub status: JobStatus,
    pub folder: PathBuf,
    /// Seconds.
    pub duration: i64,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(model: JobDbModel) -> Result<Self> {
        let status = model.status()?;
        Ok(Self {
            id: model.id,
            bvid: model.bvid,
            cid: model.cid,
            format: VideoFormat(model.format),
            title: model.title,
            owner: model.owner,
            cover: model.cover,
            status,
            folder: PathBuf::from(model.folder),
            duration: model.duration,
            output_path: model.output_path,
            error: model.error,
            created_at: ms_to_datetime(model.created_at),
            updated_at: ms_to_datetime(model.updated_at),
        })
    }
}

/// The job queue service.
pub struct JobQueue {
    jobs: Arc<dyn JobRepository>,
    audit: Arc<dyn AuditRepository>,
    settings: Arc<SettingsService>,
    /// Notify when new jobs are added.
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        audit: Arc<dyn AuditRepository>,
        settings: Arc<SettingsService>,
    ) -> Self {
        Self {
            jobs,
            audit,
            settings,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Validate and persist a submission in `waiting`, then wake a worker.
    ///
    /// The output folder is read from the settings here, once.
    pub async fn enqueue(&self, submission: JobSubmission) -> Result<i64> {
        submission.validate()?;
        let folder = self.settings.current_folder().await?;

        let created = self
            .jobs
            .create_job(&NewJobDbModel {
                bvid: submission.bvid,
                cid: submission.cid,
                format: submission.format.code(),
                title: submission.title,
                owner: submission.owner,
                cover: submission.cover,
                folder,
                duration: submission.duration,
            })
            .await?;

        info!(
            job_id = created.id,
            bvid = %created.bvid,
            cid = created.cid,
            format = created.format,
            "Enqueued job"
        );

        self.notify.notify_one();
        Ok(created.id)
    }

    /// Claim the oldest waiting job, moving it to `running`.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        match self.jobs.claim_next_waiting_job().await? {
            Some(model) => Ok(Some(Job::try_from(model)?)),
            None => Ok(None),
        }
    }

    /// Mark a running job as done.
    pub async fn complete(&self, job_id: i64, output_path: &str) -> Result<()> {
        let applied = self
            .jobs
            .transition(
                job_id,
                JobStatus::Running,
                JobStatus::Done,
                TransitionDetail::output(output_path),
            )
            .await?;
        if applied {
            info!(job_id, output = %output_path, "Job completed");
        } else {
            warn!(job_id, "Job was no longer running when it completed");
        }
        Ok(())
    }

    /// Mark a running job as failed.
    pub async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        let applied = self
            .jobs
            .transition(
                job_id,
                JobStatus::Running,
                JobStatus::Error,
                TransitionDetail::error(error),
            )
            .await?;
        if applied {
            warn!(job_id, error = %error, "Job failed");
        } else {
            warn!(job_id, "Job was no longer running when it failed");
        }
        Ok(())
    }

    /// Cancel a job that has not started yet.
    ///
    /// Running jobs cannot be cancelled; the request is rejected with
    /// `InvalidStateTransition`, as is a job a worker claimed concurrently.
    pub async fn cancel_job(&self, job_id: i64) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Waiting {
            return Err(Error::invalid_transition(job.status, JobStatus::Canceled));
        }

        let applied = self
            .jobs
            .transition(
                job_id,
                JobStatus::Waiting,
                JobStatus::Canceled,
                TransitionDetail::none(),
            )
            .await?;
        if !applied {
            let current = self.get_job(job_id).await?;
            return Err(Error::invalid_transition(current.status, JobStatus::Canceled));
        }

        // The cancel is already committed.
        if let Err(e) = self
            .audit
            .append(&format!("task {} ({}) canceled", job_id, job.bvid))
            .await
        {
            warn!(job_id, error = %e, "Failed to audit job cancellation");
        }
        info!(job_id, "Job canceled");
        self.get_job(job_id).await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        Job::try_from(self.jobs.get_job(job_id).await?)
    }

    /// Newest first. `limit <= 0` means no limit.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.jobs
            .list_jobs(status, limit)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.jobs.count_jobs_by_status().await
    }

    /// Fail every job left `waiting` or `running` by a previous run, then
    /// remove the scratch directories those jobs left behind.
    ///
    /// Must run once at startup, before any worker or request handler.
    /// Jobs are never resumed: a half-written output cannot be trusted.
    pub async fn recover_jobs(&self) -> Result<u64> {
        let mut folders: BTreeSet<PathBuf> = self
            .jobs
            .list_jobs(Some(JobStatus::Running), 0)
            .await?
            .into_iter()
            .map(|job| PathBuf::from(job.folder))
            .collect();
        folders.insert(PathBuf::from(self.settings.current_folder().await?));

        let swept = self.jobs.fail_in_flight_jobs(INTERRUPTED_REASON).await?;
        if swept > 0 {
            warn!(swept, "Marked interrupted jobs from the previous run as failed");
            self.audit
                .append(&format!(
                    "recovery: {} unfinished task(s) from the previous run marked as error",
                    swept
                ))
                .await?;
        } else {
            info!("No interrupted jobs to recover");
        }

        for folder in &folders {
            match remove_scratch_dirs(folder).await {
                Ok(0) => {}
                Ok(removed) => {
                    info!(folder = %folder.display(), removed, "Removed stale scratch directories")
                }
                Err(e) => warn!(error = %e, "Failed to clean scratch directories"),
            }
        }
        Ok(swept)
    }

    /// Shared notifier workers wait on.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
