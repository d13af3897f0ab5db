//! Remote media retrieval.

pub mod bilibili;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::pipeline::job_queue::Job;

pub use bilibili::BilibiliFetcher;

/// Local copies of a job's remote streams, ready for the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMedia {
    /// In mux order (video before audio).
    pub inputs: Vec<PathBuf>,
}

/// Retrieves the remote media of a job into `work_dir`.
///
/// Implementations must return promptly once `cancel` fires; whatever they
/// wrote under `work_dir` is discarded by the caller.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        job: &Job,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedMedia>;
}
