//! Media value types: platforms, containers, codecs and format choices.

use serde::{Deserialize, Serialize};

/// Source platform of a submitted URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Vk,
    Rutube,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Vk => "vk",
            Self::Rutube => "rutube",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "youtube" => Some(Self::Youtube),
            "vk" => Some(Self::Vk),
            "rutube" => Some(Self::Rutube),
            _ => None,
        }
    }

    /// Detect the platform from a URL host.
    pub fn detect(url: &url::Url) -> Option<Self> {
        let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
        match host {
            "youtube.com" | "youtu.be" | "music.youtube.com" => Some(Self::Youtube),
            "vk.com" | "vkvideo.ru" | "vk.ru" => Some(Self::Vk),
            "rutube.ru" => Some(Self::Rutube),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output container. Stream-copy only, so the container follows the codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
}

impl Container {
    pub fn ext(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
        }
    }

    /// Lower is more broadly compatible.
    pub fn preference_rank(&self) -> u8 {
        match self {
            Self::Mp4 => 0,
            Self::Mkv => 1,
        }
    }

    /// Check a prober-reported format name (e.g. `mov,mp4,m4a,3gp`) against this container.
    pub fn matches_format_name(&self, format_name: &str) -> bool {
        let name = format_name.to_ascii_lowercase();
        match self {
            Self::Mp4 => name.contains("mp4") || name.contains("mov"),
            Self::Mkv => name.contains("matroska") || name.contains("mkv"),
        }
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
    Unknown,
}

impl VideoCodec {
    /// Map an extractor codec string (`avc1.640028`, `vp09.00.40.08`, `av01.0.08M.08`, ...).
    pub fn from_codec_string(s: &str) -> Self {
        let v = s.trim().to_ascii_lowercase();
        if v.starts_with("avc") || v.contains("h264") {
            Self::H264
        } else if v.starts_with("hev") || v.starts_with("hvc") || v.contains("h265") || v.contains("hevc") {
            Self::H265
        } else if v.starts_with("vp09") || v.starts_with("vp9") {
            Self::Vp9
        } else if v.starts_with("av01") || v == "av1" {
            Self::Av1
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Unknown => "unknown",
        }
    }

    /// Lower is preferred.
    pub fn preference_rank(&self) -> u8 {
        match self {
            Self::H264 => 0,
            Self::H265 => 1,
            Self::Vp9 => 2,
            Self::Av1 => 3,
            Self::Unknown => 9,
        }
    }

    /// Codecs that push the output into the alternate container.
    pub fn is_low_compatibility(&self) -> bool {
        matches!(self, Self::Vp9 | Self::Av1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Vorbis,
    Mp3,
    Unknown,
}

impl AudioCodec {
    pub fn from_codec_string(s: &str) -> Self {
        let a = s.trim().to_ascii_lowercase();
        if a.starts_with("mp4a") || a.contains("aac") {
            Self::Aac
        } else if a.contains("opus") {
            Self::Opus
        } else if a.contains("vorbis") {
            Self::Vorbis
        } else if a.contains("mp3") {
            Self::Mp3
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Vorbis => "vorbis",
            Self::Mp3 => "mp3",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_low_compatibility(&self) -> bool {
        matches!(self, Self::Opus | Self::Vorbis)
    }
}

/// Delivery availability of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Safe zone: expected to be delivered.
    Guaranteed,
    /// May fail in delivery.
    Risky,
    /// Exceeds the channel's hard limit.
    Unavailable,
}

impl Availability {
    /// Lower is better.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Guaranteed => 0,
            Self::Risky => 1,
            Self::Unavailable => 2,
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            Self::Guaranteed => "\u{2705}",
            Self::Risky => "\u{26a0}\u{fe0f}",
            Self::Unavailable => "\u{274c}",
        }
    }
}

/// One encoding offered by the extractor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCandidateStream {
    pub id: String,
    pub is_video: bool,
    pub is_audio: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub video_bitrate_kbps: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    /// Extractor-reported extension (`mp4`, `webm`, `m4a`, ...).
    pub container_hint: Option<String>,
    pub size_bytes: Option<u64>,
}

impl RawCandidateStream {
    pub fn is_video_only(&self) -> bool {
        self.is_video && !self.is_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.is_audio && !self.is_video
    }

    pub fn is_muxed(&self) -> bool {
        self.is_video && self.is_audio
    }

    /// Integer frame rate; missing or non-positive values become 0.
    pub fn fps_int(&self) -> u32 {
        match self.fps {
            Some(fps) if fps.is_finite() && fps > 0.0 => fps.round() as u32,
            _ => 0,
        }
    }
}

/// Reference to a concrete extractor stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub stream_id: String,
    pub bitrate_kbps: Option<u32>,
}

/// One user-facing button: a fully specified output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatChoice {
    pub choice_id: String,
    pub label: String,
    pub container: Container,
    pub availability: Availability,
    pub video: StreamRef,
    pub audio: StreamRef,
    pub height: u32,
    pub fps: u32,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Best-effort estimate; not a guarantee.
    pub estimated_bytes: Option<u64>,
}

/// Identity of a choice for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChoiceKey {
    pub height: u32,
    pub fps: u32,
    pub video_codec: VideoCodec,
    pub container: Container,
}

impl FormatChoice {
    pub fn key(&self) -> ChoiceKey {
        ChoiceKey {
            height: self.height,
            fps: self.fps,
            video_codec: self.video_codec,
            container: self.container,
        }
    }

    /// Video and audio come from the same progressive stream.
    pub fn is_progressive(&self) -> bool {
        self.video.stream_id == self.audio.stream_id
    }

    pub fn ext(&self) -> &'static str {
        self.container.ext()
    }
}
