//! `yt-dlp` adapters: metadata extraction and single-stream download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{self, ProcessSpec};
use super::{ExtractedMedia, Extractor, StreamDownloader};
use crate::domain::{AudioCodec, RawCandidateStream, VideoCodec};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(rename = "_type")]
    kind: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    entries: Option<serde_json::Value>,
    #[serde(default)]
    formats: Vec<FormatJson>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    width: Option<f64>,
    height: Option<f64>,
    fps: Option<f64>,
    vbr: Option<f64>,
    abr: Option<f64>,
    tbr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

fn has_codec(codec: &Option<String>) -> bool {
    codec
        .as_deref()
        .is_some_and(|c| !c.is_empty() && !c.eq_ignore_ascii_case("none"))
}

fn positive_u32(v: Option<f64>) -> Option<u32> {
    v.filter(|v| v.is_finite() && *v > 0.0).map(|v| v.round() as u32)
}

fn positive_u64(v: Option<f64>) -> Option<u64> {
    v.filter(|v| v.is_finite() && *v > 0.0).map(|v| v.round() as u64)
}

impl FormatJson {
    fn into_candidate(self) -> Option<RawCandidateStream> {
        let id = self.format_id.filter(|id| !id.is_empty())?;
        let is_video = has_codec(&self.vcodec);
        let is_audio = has_codec(&self.acodec);
        if !is_video && !is_audio {
            return None;
        }
        // Single-track streams report their whole bitrate in `tbr` only.
        let video_bitrate = positive_u32(self.vbr).or_else(|| {
            (is_video && !is_audio)
                .then(|| positive_u32(self.tbr))
                .flatten()
        });
        let audio_bitrate = positive_u32(self.abr).or_else(|| {
            (is_audio && !is_video)
                .then(|| positive_u32(self.tbr))
                .flatten()
        });
        Some(RawCandidateStream {
            id,
            is_video,
            is_audio,
            width: positive_u32(self.width),
            height: positive_u32(self.height),
            fps: self.fps.filter(|f| f.is_finite() && *f > 0.0),
            video_codec: is_video
                .then(|| VideoCodec::from_codec_string(self.vcodec.as_deref().unwrap_or_default())),
            audio_codec: is_audio
                .then(|| AudioCodec::from_codec_string(self.acodec.as_deref().unwrap_or_default())),
            video_bitrate_kbps: video_bitrate,
            audio_bitrate_kbps: audio_bitrate,
            container_hint: self.ext.map(|e| e.to_ascii_lowercase()),
            size_bytes: positive_u64(self.filesize).or_else(|| positive_u64(self.filesize_approx)),
        })
    }
}

/// Parse `yt-dlp -J` output.
pub fn parse_info_json(raw: &[u8]) -> Result<ExtractedMedia> {
    let info: InfoJson = serde_json::from_slice(raw)?;
    let is_playlist = matches!(info.kind.as_deref(), Some("playlist" | "multi_video"))
        || info.entries.is_some();
    if is_playlist {
        return Err(Error::PlaylistNotSupported);
    }

    let streams: Vec<RawCandidateStream> = info
        .formats
        .into_iter()
        .filter_map(FormatJson::into_candidate)
        .collect();
    if streams.is_empty() {
        return Err(Error::NoUsableFormats("extractor returned no formats".to_string()));
    }
    Ok(ExtractedMedia {
        title: info.title,
        duration_secs: info.duration.filter(|d| d.is_finite() && *d > 0.0),
        streams,
    })
}

/// Lists formats with `yt-dlp -J`.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: PathBuf,
    timeout: Duration,
    grace: Duration,
    socket_timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration, grace: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            grace,
            socket_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout;
        self
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedMedia> {
        let spec = ProcessSpec::new("extraction", &self.program)
            .args(["-J", "--no-playlist", "--no-warnings", "--socket-timeout"])
            .arg(self.socket_timeout.as_secs().max(1).to_string())
            .arg("--")
            .arg(url)
            .timeout(self.timeout)
            .grace(self.grace)
            .capture_stdout();

        let output = process::run(&spec, None).await?;
        if !output.success() {
            warn!(url, stderr = %output.stderr_tail, "yt-dlp extraction failed");
            return Err(Error::Extraction(output.stderr_tail));
        }
        let media = parse_info_json(&output.stdout).map_err(|e| match e {
            Error::Serialization(e) => Error::Extraction(format!("invalid metadata: {e}")),
            other => other,
        })?;
        debug!(url, streams = media.streams.len(), "Extracted formats");
        Ok(media)
    }
}

/// Downloads one format with `yt-dlp -f <id>`.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: PathBuf,
    timeout: Option<Duration>,
    grace: Duration,
    retries: u32,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            grace,
            retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Find the finished file yt-dlp wrote for a `<stem>.%(ext)s` template.
async fn find_output(destination: &Path) -> Result<PathBuf> {
    let dir = destination
        .parent()
        .ok_or_else(|| Error::invariant("download destination has no parent"))?;
    let stem = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invariant("download destination has no file name"))?;
    let prefix = format!("{stem}.");

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?;
    let mut found = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        found = Some(entry.path());
        break;
    }
    found.ok_or_else(|| Error::Download("downloader produced no file".to_string()))
}

#[async_trait]
impl StreamDownloader for YtDlpDownloader {
    async fn download(
        &self,
        url: &str,
        stream_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let template = format!("{}.%(ext)s", destination.display());
        let mut spec = ProcessSpec::new("download", &self.program)
            .args(["--no-playlist", "--no-warnings", "--no-part", "--no-mtime", "-f"])
            .arg(stream_id)
            .arg("--retries")
            .arg(self.retries.to_string())
            .arg("-o")
            .arg(template)
            .arg("--")
            .arg(url)
            .grace(self.grace);
        if let Some(timeout) = self.timeout {
            spec = spec.timeout(timeout);
        }

        info!(stream_id, "Downloading stream");
        let output = process::run(&spec, Some(cancel)).await?;
        if !output.success() {
            warn!(stream_id, stderr = %output.stderr_tail, "yt-dlp download failed");
            return Err(Error::Download(output.stderr_tail));
        }
        let path = find_output(destination).await?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io_path("reading metadata of", &path, e))?
            .len();
        if size == 0 {
            return Err(Error::Download("downloaded file is empty".to_string()));
        }
        debug!(stream_id, path = %path.display(), size, "Stream downloaded");
        Ok(path)
    }
}
