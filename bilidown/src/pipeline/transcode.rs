//! Transcode runner.
//!
//! FFmpeg runs as a supervised child: stderr is collected as diagnostics,
//! the child is killed on timeout, on cancellation and when its future is
//! dropped, and every way it can end is reported as a [`TranscodeOutcome`].

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use process_utils::{executable_name, supervised_command};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Lines of stderr kept for a failed run.
const MAX_DIAGNOSTIC_LINES: usize = 40;

/// How long to wait for the stderr reader once the child is gone.
const DIAGNOSTICS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What to transcode.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Local input files, muxed in order.
    pub inputs: Vec<PathBuf>,
    /// Final `.mp4` path. Must not exist yet.
    pub output: PathBuf,
    pub timeout: Duration,
}

/// How a transcode ended. Anything but `Success` fails the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Success {
        output: PathBuf,
        exit_code: i32,
        duration: Duration,
    },
    /// Exited nonzero, or was killed by a signal (`exit_code: None`).
    Failed {
        exit_code: Option<i32>,
        diagnostics: Vec<String>,
    },
    /// The process could not be started at all.
    SpawnFailed { reason: String },
    TimedOut { diagnostics: Vec<String> },
    Cancelled,
}

impl TranscodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// One-line description stored as the job's error text.
    pub fn describe(&self) -> String {
        match self {
            Self::Success { output, .. } => format!("transcoded to {}", output.display()),
            Self::Failed {
                exit_code,
                diagnostics,
            } => {
                let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                match diagnostics.last() {
                    Some(last) => format!("ffmpeg exited with {code}: {last}"),
                    None => format!("ffmpeg exited with {code}"),
                }
            }
            Self::SpawnFailed { reason } => format!("failed to start ffmpeg: {reason}"),
            Self::TimedOut { .. } => "ffmpeg timed out".to_string(),
            Self::Cancelled => "ffmpeg was cancelled".to_string(),
        }
    }
}

/// Runs the external transcoder for a job.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> TranscodeOutcome;
}

/// [`Transcoder`] backed by an FFmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    executable: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

/// Stream-copy every input into one `.mp4`.
pub fn ffmpeg_args(request: &TranscodeRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "warning", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect();
    for input in &request.inputs {
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
    }
    for index in 0..request.inputs.len() {
        args.push("-map".into());
        args.push(index.to_string().into());
    }
    args.extend(
        ["-c", "copy", "-movflags", "+faststart", "-f", "mp4"]
            .into_iter()
            .map(OsString::from),
    );
    args.push(request.output.as_os_str().to_owned());
    args
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> TranscodeOutcome {
        let mut command = supervised_command(&self.executable);
        command.args(ffmpeg_args(request));

        debug!(
            executable = %self.executable.display(),
            output = %request.output.display(),
            inputs = request.inputs.len(),
            "Starting ffmpeg"
        );

        match supervise(command, request.timeout, cancel).await {
            ProcessExit::Exited {
                code: Some(0),
                elapsed,
                ..
            } => {
                info!(
                    output = %request.output.display(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "ffmpeg finished"
                );
                TranscodeOutcome::Success {
                    output: request.output.clone(),
                    exit_code: 0,
                    duration: elapsed,
                }
            }
            ProcessExit::Exited {
                code, diagnostics, ..
            } => TranscodeOutcome::Failed {
                exit_code: code,
                diagnostics,
            },
            ProcessExit::SpawnFailed { reason } => TranscodeOutcome::SpawnFailed { reason },
            ProcessExit::TimedOut { diagnostics } => TranscodeOutcome::TimedOut { diagnostics },
            ProcessExit::Cancelled => TranscodeOutcome::Cancelled,
        }
    }
}

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited {
        code: Option<i32>,
        diagnostics: Vec<String>,
        elapsed: Duration,
    },
    SpawnFailed {
        reason: String,
    },
    TimedOut {
        diagnostics: Vec<String>,
    },
    Cancelled,
}

/// Spawn `command` and wait for it under `timeout` and `cancel`.
///
/// The command should pipe stderr (see [`supervised_command`]); its last
/// lines are returned as diagnostics. On timeout or cancellation the child
/// is killed and reaped before this returns.
pub async fn supervise(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProcessExit {
    let started = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn child process");
            return ProcessExit::SpawnFailed {
                reason: e.to_string(),
            };
        }
    };

    let stderr_reader = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(collect_diagnostics(stderr)));

    enum Ended {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let ended = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Ended::Cancelled
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "Child process timed out; killing");
            let _ = child.kill().await;
            Ended::TimedOut
        }
        status = child.wait() => Ended::Exited(status),
    };

    let diagnostics = match stderr_reader {
        Some(handle) => match tokio::time::timeout(DIAGNOSTICS_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(lines)) => lines,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };

    match ended {
        Ended::Exited(Ok(status)) => {
            if !status.success() {
                warn!(code = ?status.code(), "Child process exited unsuccessfully");
            }
            ProcessExit::Exited {
                code: status.code(),
                diagnostics,
                elapsed: started.elapsed(),
            }
        }
        Ended::Exited(Err(e)) => {
            warn!(error = %e, "Error waiting for child process");
            ProcessExit::Exited {
                code: None,
                diagnostics,
                elapsed: started.elapsed(),
            }
        }
        Ended::TimedOut => ProcessExit::TimedOut { diagnostics },
        Ended::Cancelled => ProcessExit::Cancelled,
    }
}

async fn collect_diagnostics<R>(stream: R) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail = VecDeque::with_capacity(MAX_DIAGNOSTIC_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("stderr: {}", line);
        if tail.len() == MAX_DIAGNOSTIC_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// Resolve the transcoder once at startup.
///
/// An explicitly configured path must point at an executable file.
/// Otherwise `./bin/<name>` is tried, then every `PATH` entry.
pub fn locate_executable(stem: &str, configured: Option<&Path>) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH");
    locate_executable_in(stem, configured, Path::new("bin"), path_var.as_deref())
}

pub fn locate_executable_in(
    stem: &str,
    configured: Option<&Path>,
    bin_dir: &Path,
    path_var: Option<&OsStr>,
) -> Result<PathBuf> {
    let name = executable_name(stem);

    if let Some(path) = configured {
        if is_executable_file(path) {
            return Ok(path.to_path_buf());
        }
        return Err(Error::ExecutableNotFound {
            name,
            searched: path.display().to_string(),
        });
    }

    let mut searched = vec![bin_dir.join(&name)];
    if let Some(path_var) = path_var {
        searched.extend(std::env::split_paths(path_var).map(|dir| dir.join(&name)));
    }

    match searched.iter().find(|candidate| is_executable_file(candidate)) {
        Some(found) => Ok(found.clone()),
        None => Err(Error::ExecutableNotFound {
            name,
            searched: searched
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
