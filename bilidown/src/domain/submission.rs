//! Job submission value object.

use serde::{Deserialize, Serialize};

use super::VideoFormat;
use crate::{Error, Result};

/// What a client asks the queue to download.
///
/// The output folder is not part of the submission: it is resolved from the
/// current setting when the job is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub bvid: String,
    pub cid: i64,
    pub format: VideoFormat,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub cover: String,
    /// Seconds.
    #[serde(default)]
    pub duration: i64,
}

impl JobSubmission {
    pub fn new(bvid: impl Into<String>, cid: i64, format: impl Into<VideoFormat>) -> Self {
        Self {
            bvid: bvid.into(),
            cid,
            format: format.into(),
            title: String::new(),
            owner: String::new(),
            cover: String::new(),
            duration: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_cover(mut self, cover: impl Into<String>) -> Self {
        self.cover = cover.into();
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bvid.is_empty() {
            return Err(Error::validation("bvid must not be empty"));
        }
        if self.bvid.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "bvid '{}' must not contain whitespace",
                self.bvid
            )));
        }
        if self.cid <= 0 {
            return Err(Error::validation(format!("cid must be positive, got {}", self.cid)));
        }
        if !self.format.is_valid() {
            return Err(Error::validation(format!(
                "format must be positive, got {}",
                self.format.code()
            )));
        }
        if self.duration < 0 {
            return Err(Error::validation(format!(
                "duration must not be negative, got {}",
                self.duration
            )));
        }
        Ok(())
    }
}
