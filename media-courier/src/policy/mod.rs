//! Format policy: turns the extractor's raw encodings into a small set of
//! deduplicated, ranked, risk-classified choices.
//!
//! The engine is pure. The same input always yields the same output, and
//! choice ids depend only on platform, height, fps, codec and container.

pub mod risk;

use std::cmp::Ordering;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::domain::{
    AudioCodec, Availability, ChoiceKey, Container, FormatChoice, RawCandidateStream, StreamRef,
    VideoCodec,
};
use crate::{Error, Result};

pub use risk::{ChannelLimits, MIB, RiskPolicy};

/// MKV when either codec does not fit well into MP4.
pub fn choose_container(video: VideoCodec, audio: AudioCodec) -> Container {
    if video.is_low_compatibility() || audio.is_low_compatibility() {
        Container::Mkv
    } else {
        Container::Mp4
    }
}

/// Stable id for a choice key on a platform.
pub fn stable_choice_id(platform_key: &str, key: &ChoiceKey) -> String {
    let seed = format!(
        "{}:{}:{}:{}:{}",
        platform_key,
        key.height,
        key.fps,
        key.video_codec.as_str(),
        key.container.ext()
    );
    let digest = Sha256::digest(seed.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

/// Button text: availability marker and height, plus whatever tells apart
/// choices sharing a height.
pub fn build_label(choice: &FormatChoice) -> String {
    let mut label = format!("{} {}p", choice.availability.marker(), choice.height);
    if choice.fps >= 50 {
        label.push_str(&choice.fps.to_string());
    }
    if choice.container == Container::Mkv {
        label.push_str(" MKV");
    }
    if choice.video_codec != VideoCodec::H264 {
        label.push(' ');
        label.push_str(&choice.video_codec.as_str().to_ascii_uppercase());
    }
    label
}

/// Rank order for dedup; `Less` means better.
pub fn compare_rank(a: &FormatChoice, b: &FormatChoice) -> Ordering {
    a.availability
        .rank()
        .cmp(&b.availability.rank())
        .then(a.container.preference_rank().cmp(&b.container.preference_rank()))
        .then(a.video_codec.preference_rank().cmp(&b.video_codec.preference_rank()))
        .then(b.fps.cmp(&a.fps))
        .then(size_rank(a.estimated_bytes).cmp(&size_rank(b.estimated_bytes)))
}

fn size_rank(size: Option<u64>) -> u64 {
    size.unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Default)]
pub struct FormatPolicyEngine {
    limits: ChannelLimits,
    risk: RiskPolicy,
}

impl FormatPolicyEngine {
    pub fn new(limits: ChannelLimits, risk: RiskPolicy) -> Self {
        Self { limits, risk }
    }

    /// Build the final, user-facing choice list.
    ///
    /// Sorted by descending height; ties are broken by rank, then by id.
    pub fn build_choices(
        &self,
        platform_key: &str,
        streams: &[RawCandidateStream],
    ) -> Result<Vec<FormatChoice>> {
        let videos: Vec<&RawCandidateStream> =
            streams.iter().filter(|s| s.is_video_only()).collect();
        let audios: Vec<&RawCandidateStream> =
            streams.iter().filter(|s| s.is_audio_only()).collect();
        let muxed: Vec<&RawCandidateStream> = streams.iter().filter(|s| s.is_muxed()).collect();

        let built = if !muxed.is_empty() && (videos.is_empty() || audios.is_empty()) {
            muxed
                .iter()
                .filter_map(|m| self.progressive_choice(platform_key, m))
                .collect::<Vec<_>>()
        } else {
            let Some(best_audio) = best_audio(&audios) else {
                return Err(Error::NoUsableFormats("no audio stream".to_string()));
            };
            videos
                .iter()
                .filter_map(|v| self.paired_choice(platform_key, v, best_audio))
                .collect::<Vec<_>>()
        };

        if built.is_empty() {
            return Err(Error::NoUsableFormats(
                "no video stream with a usable height".to_string(),
            ));
        }

        let choices = deduplicate(built);
        if choices.is_empty() {
            return Err(Error::NoUsableFormats(
                "every format exceeds the channel limit".to_string(),
            ));
        }
        tracing::debug!(
            platform = platform_key,
            input = streams.len(),
            output = choices.len(),
            "Built format choices"
        );
        Ok(choices)
    }

    fn paired_choice(
        &self,
        platform_key: &str,
        video: &RawCandidateStream,
        audio: &RawCandidateStream,
    ) -> Option<FormatChoice> {
        let height = video.height.filter(|h| *h > 0)?;
        let video_codec = video.video_codec.unwrap_or(VideoCodec::Unknown);
        let audio_codec = audio.audio_codec.unwrap_or(AudioCodec::Unknown);
        let container = container_for(video, video_codec, audio_codec);
        let estimated = match (video.size_bytes, audio.size_bytes) {
            (Some(v), Some(a)) => Some(self.risk.with_overhead(v.saturating_add(a))),
            _ => None,
        };
        Some(self.classified(
            platform_key,
            height,
            video.fps_int(),
            video_codec,
            audio_codec,
            container,
            estimated,
            StreamRef {
                stream_id: video.id.clone(),
                bitrate_kbps: video.video_bitrate_kbps,
            },
            StreamRef {
                stream_id: audio.id.clone(),
                bitrate_kbps: audio.audio_bitrate_kbps,
            },
        ))
    }

    fn progressive_choice(
        &self,
        platform_key: &str,
        muxed: &RawCandidateStream,
    ) -> Option<FormatChoice> {
        let height = muxed.height.filter(|h| *h > 0)?;
        let video_codec = muxed.video_codec.unwrap_or(VideoCodec::Unknown);
        let audio_codec = muxed.audio_codec.unwrap_or(AudioCodec::Unknown);
        let container = container_for(muxed, video_codec, audio_codec);
        let estimated = muxed.size_bytes.map(|b| self.risk.with_overhead(b));
        Some(self.classified(
            platform_key,
            height,
            muxed.fps_int(),
            video_codec,
            audio_codec,
            container,
            estimated,
            StreamRef {
                stream_id: muxed.id.clone(),
                bitrate_kbps: muxed.video_bitrate_kbps,
            },
            StreamRef {
                stream_id: muxed.id.clone(),
                bitrate_kbps: muxed.audio_bitrate_kbps,
            },
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn classified(
        &self,
        platform_key: &str,
        height: u32,
        fps: u32,
        video_codec: VideoCodec,
        audio_codec: AudioCodec,
        container: Container,
        estimated_bytes: Option<u64>,
        video: StreamRef,
        audio: StreamRef,
    ) -> FormatChoice {
        let boost = self.risk.boost(height, fps, video_codec, container);
        let availability = self.risk.classify(estimated_bytes, &self.limits, boost);
        let key = ChoiceKey {
            height,
            fps,
            video_codec,
            container,
        };
        let mut choice = FormatChoice {
            choice_id: stable_choice_id(platform_key, &key),
            label: String::new(),
            container,
            availability,
            video,
            audio,
            height,
            fps,
            video_codec,
            audio_codec,
            estimated_bytes,
        };
        choice.label = build_label(&choice);
        choice
    }
}

/// Unknown codecs in a webm stream cannot go into MP4 by stream copy.
fn container_for(stream: &RawCandidateStream, video: VideoCodec, audio: AudioCodec) -> Container {
    let webm_hint = stream
        .container_hint
        .as_deref()
        .is_some_and(|h| h.eq_ignore_ascii_case("webm"));
    if webm_hint && video == VideoCodec::Unknown {
        return Container::Mkv;
    }
    choose_container(video, audio)
}

/// Highest bitrate, then largest size. The first stream wins exact ties.
fn best_audio<'a>(audios: &[&'a RawCandidateStream]) -> Option<&'a RawCandidateStream> {
    let mut best: Option<&'a RawCandidateStream> = None;
    for candidate in audios {
        let better = match best {
            None => true,
            Some(current) => {
                let c = (
                    candidate.audio_bitrate_kbps.unwrap_or(0),
                    candidate.size_bytes.unwrap_or(0),
                );
                let b = (
                    current.audio_bitrate_kbps.unwrap_or(0),
                    current.size_bytes.unwrap_or(0),
                );
                c > b
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

/// Keep the best-ranked choice per key, drop unavailable ones and sort.
fn deduplicate(choices: Vec<FormatChoice>) -> Vec<FormatChoice> {
    let mut best: HashMap<ChoiceKey, FormatChoice> = HashMap::new();
    for choice in choices {
        match best.get(&choice.key()) {
            Some(current) if !is_better(&choice, current) => {}
            _ => {
                best.insert(choice.key(), choice);
            }
        }
    }

    let mut out: Vec<FormatChoice> = best
        .into_values()
        .filter(|c| c.availability != Availability::Unavailable)
        .collect();
    out.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then_with(|| compare_rank(a, b))
            .then_with(|| a.choice_id.cmp(&b.choice_id))
    });
    out
}

/// Strictly better rank, or equal rank with a smaller stream id so that
/// input order does not matter.
fn is_better(candidate: &FormatChoice, current: &FormatChoice) -> bool {
    match compare_rank(candidate, current) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => {
            (&candidate.video.stream_id, &candidate.audio.stream_id)
                < (&current.video.stream_id, &current.audio.stream_id)
        }
    }
}
