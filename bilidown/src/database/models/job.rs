//! Job database models and the job state machine.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

/// Job database model.
/// One download-and-transcode unit of work (a row of the `task` table).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: i64,
    /// Remote video identifier (BV id).
    pub bvid: String,
    /// Remote sub-stream identifier (page cid).
    pub cid: i64,
    /// Requested quality code.
    pub format: i64,
    pub title: String,
    pub owner: String,
    pub cover: String,
    /// Status: waiting, running, done, error, canceled
    pub status: String,
    /// Output folder resolved at creation time.
    pub folder: String,
    /// Duration of the video in seconds.
    pub duration: i64,
    /// Final file, set together with the `done` transition.
    pub output_path: Option<String>,
    /// Failure diagnostic, set together with the `error` transition.
    pub error: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds of the last status transition.
    pub updated_at: i64,
}

impl JobDbModel {
    /// Parse the persisted status, rejecting values outside the state machine.
    pub fn status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Database(format!(
                "job {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }
}

/// Column values for a job that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewJobDbModel {
    pub bvid: String,
    pub cid: i64,
    pub format: i64,
    pub title: String,
    pub owner: String,
    pub cover: String,
    pub folder: String,
    pub duration: i64,
}

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not yet claimed by a worker.
    Waiting,
    /// Claimed by a worker; fetch/transcode in progress.
    Running,
    /// Output file produced.
    Done,
    /// Failed, or interrupted by an unclean shutdown.
    Error,
    /// Withdrawn before it finished.
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Running,
        Self::Done,
        Self::Error,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    /// Statuses that are only meaningful while the owning process is alive.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running)
                | (Self::Waiting, Self::Error)
                | (Self::Waiting, Self::Canceled)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Canceled)
        )
    }
}

/// Columns written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub output_path: Option<String>,
    pub error: Option<String>,
}

impl TransitionDetail {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn output(path: impl Into<String>) -> Self {
        Self {
            output_path: Some(path.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output_path: None,
            error: Some(message.into()),
        }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    pub canceled: u64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Waiting => self.waiting += count,
            JobStatus::Running => self.running += count,
            JobStatus::Done => self.done += count,
            JobStatus::Error => self.error += count,
            JobStatus::Canceled => self.canceled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.running + self.done + self.error + self.canceled
    }
}
