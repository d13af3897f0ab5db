//! Domain layer for bilidown.
//!
//! Value objects shared by the queue, the fetcher and the HTTP adapter.

pub mod format;
pub mod submission;

pub use format::VideoFormat;
pub use submission::JobSubmission;
