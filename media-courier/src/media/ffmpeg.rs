//! `ffmpeg` stream-copy muxing and `ffprobe` inspection.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::process::{self, ProcessSpec};
use super::{Muxer, ProbeReport, Prober};
use crate::domain::Container;
use crate::storage::fs::{ensure_dir_all, file_size};
use crate::{Error, Result};

/// Muxes with `ffmpeg -c copy`. Never re-encodes.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
    timeout: Duration,
    grace: Duration,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration, grace: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            grace,
        }
    }

    fn base_args() -> Vec<OsString> {
        ["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect()
    }

    fn output_args(container: Container, destination: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-c".into(), "copy".into()];
        if container == Container::Mp4 {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }
        args.push("-f".into());
        args.push(
            match container {
                Container::Mp4 => "mp4",
                Container::Mkv => "matroska",
            }
            .into(),
        );
        args.push(destination.as_os_str().to_owned());
        args
    }

    async fn run_ffmpeg(
        &self,
        args: Vec<OsString>,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if let Some(parent) = destination.parent() {
            ensure_dir_all(parent).await?;
        }
        let spec = ProcessSpec::new("merge", &self.program)
            .args(args)
            .timeout(self.timeout)
            .grace(self.grace);

        let output = process::run(&spec, Some(cancel)).await?;
        if !output.success() {
            error!(stderr = %output.stderr_tail, "ffmpeg failed");
            return Err(Error::Merge(output.stderr_tail));
        }
        match file_size(destination).await? {
            Some(size) if size > 0 => {
                debug!(path = %destination.display(), size, "Muxed output written");
                Ok(destination.to_path_buf())
            }
            _ => Err(Error::Merge("ffmpeg produced empty output".to_string())),
        }
    }
}

async fn require_input(path: &Path, what: &str) -> Result<()> {
    match file_size(path).await? {
        Some(_) => Ok(()),
        None => Err(Error::Merge(format!("{what} input not found"))),
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        destination: &Path,
        container: Container,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        require_input(video, "video").await?;
        require_input(audio, "audio").await?;

        let mut args = Self::base_args();
        args.extend([
            "-i".into(),
            video.as_os_str().to_owned(),
            "-i".into(),
            audio.as_os_str().to_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
        ]);
        args.extend(Self::output_args(container, destination));
        self.run_ffmpeg(args, destination, cancel).await
    }

    async fn remux(
        &self,
        input: &Path,
        destination: &Path,
        container: Container,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        require_input(input, "progressive").await?;

        let mut args = Self::base_args();
        args.extend([
            "-i".into(),
            input.as_os_str().to_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0".into(),
        ]);
        args.extend(Self::output_args(container, destination));
        self.run_ffmpeg(args, destination, cancel).await
    }
}

#[derive(Debug, Deserialize)]
struct ProbeJson {
    streams: Option<Vec<ProbeStream>>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

/// Parse `ffprobe -print_format json` output. `size_bytes` is filled by the caller.
pub fn parse_probe_json(raw: &[u8]) -> Result<ProbeReport> {
    let parsed: ProbeJson = serde_json::from_slice(raw)?;
    let streams = parsed
        .streams
        .ok_or_else(|| Error::Probe("prober returned no stream list".to_string()))?;
    let has = |kind: &str| streams.iter().any(|s| s.codec_type.as_deref() == Some(kind));
    let (format_name, duration_secs) = match parsed.format {
        Some(format) => (
            format.format_name,
            format.duration.and_then(|d| d.trim().parse::<f64>().ok()),
        ),
        None => (None, None),
    };
    Ok(ProbeReport {
        has_video: has("video"),
        has_audio: has("audio"),
        duration_secs,
        format_name,
        size_bytes: 0,
    })
}

#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
    timeout: Duration,
    grace: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration, grace: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            grace,
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let Some(size) = file_size(path).await? else {
            return Err(Error::Probe("file does not exist".to_string()));
        };
        let spec = ProcessSpec::new("probe", &self.program)
            .args(["-v", "error", "-show_format", "-show_streams", "-print_format", "json"])
            .arg(path.as_os_str())
            .timeout(self.timeout)
            .grace(self.grace)
            .capture_stdout();

        let output = process::run(&spec, None).await?;
        if !output.success() {
            return Err(Error::Probe(output.stderr_tail));
        }
        let mut report = parse_probe_json(&output.stdout).map_err(|e| match e {
            Error::Serialization(e) => Error::Probe(format!("invalid prober output: {e}")),
            other => other,
        })?;
        report.size_bytes = size;
        Ok(report)
    }
}
