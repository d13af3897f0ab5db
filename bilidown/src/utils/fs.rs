//! Filesystem helpers shared across modules.
//!
//! Errors carry the operation and the path, which plain `io::Error` lacks.

use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result};

/// Name prefix of the per-job scratch directories inside a download folder.
pub const SCRATCH_DIR_PREFIX: &str = ".bilidown-";

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path("creating directory", path, e))
}

/// Synchronous variant of [`ensure_dir_all`], for startup code.
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path("creating directory", path, e))
}

/// `true` when `path` is a regular file with at least one byte.
pub async fn is_non_empty_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Remove a file, treating "already gone" as success. Other failures are
/// logged, not returned: callers use this on cleanup paths.
pub async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Remove scratch directories a previous run left in `dir`.
///
/// Returns how many were removed. A missing `dir` has none. Only call this
/// while no job is running.
pub async fn remove_scratch_dirs(dir: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io_path("reading directory", dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?
    {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(SCRATCH_DIR_PREFIX)
        {
            continue;
        }
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale scratch directory");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
    Ok(removed)
}
