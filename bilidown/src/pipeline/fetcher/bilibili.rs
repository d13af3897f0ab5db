//! Bilibili fetcher.
//!
//! Resolves stream URLs through the web playurl API and downloads them into
//! the job's work directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{COOKIE, REFERER};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{FetchedMedia, Fetcher};
use crate::config::SettingsService;
use crate::domain::VideoFormat;
use crate::pipeline::job_queue::Job;
use crate::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";
const BILIBILI_REFERER: &str = "https://www.bilibili.com";

/// `fnval=16` asks for DASH, `fourk=1` allows 4K representations.
const PLAYURL_FNVAL: &str = "16";

#[derive(Debug, Deserialize)]
struct PlayUrlResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PlayUrlData>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PlayUrlData {
    #[serde(default)]
    dash: Option<Dash>,
    #[serde(default)]
    durl: Vec<Durl>,
}

#[derive(Debug, Default, Deserialize)]
struct Dash {
    #[serde(default)]
    video: Vec<DashStream>,
    #[serde(default)]
    audio: Option<Vec<DashStream>>,
}

#[derive(Debug, Clone, Deserialize)]
struct DashStream {
    /// Quality code for video, audio quality id for audio.
    id: i64,
    /// The payload repeats this value as `base_url`, which is ignored.
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(default)]
    bandwidth: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct Durl {
    #[serde(default)]
    order: i64,
    url: String,
}

/// One remote resource and the local file name it is saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MediaSource {
    pub url: String,
    pub file_name: &'static str,
}

/// Pick what to download for `wanted`.
///
/// DASH video: the representation with exactly the wanted quality, else the
/// best one below it, else the lowest offered; ties go to the higher
/// bandwidth. DASH audio: the highest bandwidth. Without DASH, a single
/// progressive `durl` file is used.
pub(crate) fn select_sources(data: &PlayUrlData, wanted: VideoFormat) -> Result<Vec<MediaSource>> {
    if let Some(dash) = data.dash.as_ref().filter(|d| !d.video.is_empty()) {
        let by_quality_then_bandwidth =
            |a: &&DashStream, b: &&DashStream| (a.id, a.bandwidth).cmp(&(b.id, b.bandwidth));

        let video = dash
            .video
            .iter()
            .filter(|v| v.id <= wanted.code())
            .max_by(by_quality_then_bandwidth)
            .or_else(|| dash.video.iter().min_by(|a, b| {
                a.id.cmp(&b.id).then(b.bandwidth.cmp(&a.bandwidth))
            }))
            .ok_or_else(|| Error::fetch("no video representation offered"))?;

        let mut sources = vec![MediaSource {
            url: video.base_url.clone(),
            file_name: "video.m4s",
        }];

        if let Some(audio) = dash
            .audio
            .as_deref()
            .and_then(|audio| audio.iter().max_by_key(|a| a.bandwidth))
        {
            sources.push(MediaSource {
                url: audio.base_url.clone(),
                file_name: "audio.m4s",
            });
        }
        return Ok(sources);
    }

    let mut durl = data.durl.clone();
    durl.sort_by_key(|d| d.order);
    match durl.as_slice() {
        [] => Err(Error::fetch("playurl response has neither dash nor durl streams")),
        [single] => Ok(vec![MediaSource {
            url: single.url.clone(),
            file_name: "progressive.flv",
        }]),
        segments => Err(Error::fetch(format!(
            "segmented progressive stream ({} parts) is not supported",
            segments.len()
        ))),
    }
}

/// [`Fetcher`] for Bilibili videos.
pub struct BilibiliFetcher {
    client: Client,
    settings: Arc<SettingsService>,
    api_base: String,
}

impl BilibiliFetcher {
    pub fn new(client: Client, settings: Arc<SettingsService>) -> Self {
        Self::with_api_base(client, settings, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        client: Client,
        settings: Arc<SettingsService>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            settings,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, url: &str, sessdata: Option<&str>) -> reqwest::RequestBuilder {
        let request = self.client.get(url).header(REFERER, BILIBILI_REFERER);
        match sessdata {
            Some(sessdata) => request.header(COOKIE, format!("SESSDATA={sessdata}")),
            None => request,
        }
    }

    async fn resolve(&self, job: &Job, sessdata: Option<&str>) -> Result<PlayUrlData> {
        let url = format!("{}/x/player/playurl", self.api_base);
        let cid = job.cid.to_string();
        let qn = job.format.code().to_string();
        let response = self
            .request(&url, sessdata)
            .query(&[
                ("bvid", job.bvid.as_str()),
                ("cid", cid.as_str()),
                ("qn", qn.as_str()),
                ("fnval", PLAYURL_FNVAL),
                ("fourk", "1"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: PlayUrlResponse = response.json().await?;
        if body.code != 0 {
            return Err(Error::fetch(format!(
                "playurl API returned code {}: {}",
                body.code, body.message
            )));
        }
        body.data
            .ok_or_else(|| Error::fetch("playurl API returned no data"))
    }

    async fn download(
        &self,
        source: &MediaSource,
        dest: &Path,
        sessdata: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let response = self
            .request(&source.url, sessdata)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::io_path("creating", dest, e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::fetch("download cancelled")),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io_path("writing", dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::io_path("writing", dest, e))?;

        if written == 0 {
            return Err(Error::fetch(format!("empty response body from {}", source.url)));
        }
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for BilibiliFetcher {
    #[instrument(skip(self, job, work_dir, cancel), fields(job_id = job.id, bvid = %job.bvid))]
    async fn fetch(
        &self,
        job: &Job,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedMedia> {
        let sessdata = self.settings.sessdata().await?;
        let data = self.resolve(job, sessdata.as_deref()).await?;
        let sources = select_sources(&data, job.format)?;
        debug!(streams = sources.len(), "Resolved media streams");

        let mut inputs: Vec<PathBuf> = Vec::with_capacity(sources.len());
        for source in &sources {
            let dest = work_dir.join(source.file_name);
            let bytes = self
                .download(source, &dest, sessdata.as_deref(), cancel)
                .await?;
            debug!(file = source.file_name, bytes, "Downloaded stream");
            inputs.push(dest);
        }

        info!(streams = inputs.len(), "Fetched media");
        Ok(FetchedMedia { inputs })
    }
}
