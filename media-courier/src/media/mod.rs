//! External media collaborators: extraction, download, muxing, probing.
//!
//! The pipeline only sees the traits; concrete adapters drive `yt-dlp`,
//! `ffmpeg` and `ffprobe` through [`process::run`].

pub mod ffmpeg;
pub mod process;
pub mod ytdlp;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::domain::{Container, RawCandidateStream};

pub use ffmpeg::{FfmpegMuxer, FfprobeProber};
pub use ytdlp::{YtDlpDownloader, YtDlpExtractor};

/// Metadata of a single media item.
#[derive(Debug, Clone, Default)]
pub struct ExtractedMedia {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub streams: Vec<RawCandidateStream>,
}

/// What the prober found in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub has_video: bool,
    pub has_audio: bool,
    pub duration_secs: Option<f64>,
    pub format_name: Option<String>,
    pub size_bytes: u64,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// List the encodings of a single media item.
    ///
    /// Fails with `PlaylistNotSupported` for multi-item sources and
    /// `NoUsableFormats` when nothing is offered.
    async fn extract(&self, url: &str) -> Result<ExtractedMedia>;
}

#[async_trait]
pub trait StreamDownloader: Send + Sync {
    /// Download one stream next to `destination` and return the file's path.
    ///
    /// `destination` is a path stem; the downloader picks the extension.
    async fn download(
        &self,
        url: &str,
        stream_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Stream-copy a video and an audio file into `destination`.
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        destination: &Path,
        container: Container,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;

    /// Stream-copy a progressive file into the target container.
    async fn remux(
        &self,
        input: &Path,
        destination: &Path,
        container: Container,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport>;
}
