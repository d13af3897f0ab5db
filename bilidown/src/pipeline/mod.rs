//! Job pipeline: the persistent queue, the worker pool that drains it, and
//! the fetch and transcode stages each job runs through.

pub mod fetcher;
pub mod job_queue;
pub mod transcode;
pub mod worker_pool;

pub use fetcher::{BilibiliFetcher, FetchedMedia, Fetcher};
pub use job_queue::{Job, JobQueue};
pub use transcode::{FfmpegTranscoder, TranscodeOutcome, TranscodeRequest, Transcoder};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
