//! Environment-driven application configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:bilidown.db?mode=rwc";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:25008";
pub const DEFAULT_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 16;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Application configuration.
///
/// Supported env vars (a `.env` file in the working directory is honoured):
/// - `DATABASE_URL`
/// - `BILIDOWN_HTTP_ADDR` (e.g. "127.0.0.1:25008")
/// - `BILIDOWN_WORKERS` (clamped to 1..=16)
/// - `BILIDOWN_JOB_TIMEOUT_SECS`
/// - `BILIDOWN_POLL_INTERVAL_MS`
/// - `BILIDOWN_FFMPEG` (explicit transcoder path)
/// - `BILIDOWN_DOWNLOAD_DIR` (initial download folder)
/// - `BILIDOWN_LOG_DIR`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub http_addr: SocketAddr,
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub ffmpeg_path: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 25008)),
            workers: DEFAULT_WORKERS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ffmpeg_path: None,
            download_dir: PathBuf::from("download"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /// Load from the process environment (after `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(addr) = get("BILIDOWN_HTTP_ADDR") {
            config.http_addr = parse_var("BILIDOWN_HTTP_ADDR", &addr)?;
        }
        if let Some(workers) = get("BILIDOWN_WORKERS") {
            let workers: usize = parse_var("BILIDOWN_WORKERS", &workers)?;
            config.workers = workers.clamp(1, MAX_WORKERS);
        }
        if let Some(secs) = get("BILIDOWN_JOB_TIMEOUT_SECS") {
            config.job_timeout_secs = parse_var("BILIDOWN_JOB_TIMEOUT_SECS", &secs)?;
            if config.job_timeout_secs == 0 {
                return Err(Error::config("BILIDOWN_JOB_TIMEOUT_SECS must be positive"));
            }
        }
        if let Some(ms) = get("BILIDOWN_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("BILIDOWN_POLL_INTERVAL_MS", &ms)?;
            if config.poll_interval_ms == 0 {
                return Err(Error::config("BILIDOWN_POLL_INTERVAL_MS must be positive"));
            }
        }
        if let Some(path) = get("BILIDOWN_FFMPEG") {
            config.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = get("BILIDOWN_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("BILIDOWN_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::config(format!("invalid {key}='{value}': {e}")))
}
