//! Channel size limits and risk heuristics.
//!
//! The numbers are tuned for one delivery channel's observed behavior and
//! are configuration, not law.

use serde::{Deserialize, Serialize};

use crate::domain::{Availability, Container, VideoCodec};
use crate::{Error, Result};

pub const MIB: u64 = 1024 * 1024;

/// Size thresholds of the delivery channel, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLimits {
    /// Nothing above this can be delivered.
    pub hard_bytes: u64,
    /// Upper bound of the safe zone.
    pub safe_bytes: u64,
    /// Upper bound of the risk zone; above it delivery is best effort.
    pub risky_bytes: u64,
    /// At or above this size only the plain document upload is attempted.
    pub document_only_bytes: u64,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self::from_mib(2000, 900, 1500, 300)
    }
}

impl ChannelLimits {
    pub fn from_mib(hard: u64, safe: u64, risky: u64, document_only: u64) -> Self {
        Self {
            hard_bytes: hard * MIB,
            safe_bytes: safe * MIB,
            risky_bytes: risky * MIB,
            document_only_bytes: document_only * MIB,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.safe_bytes >= self.hard_bytes {
            return Err(Error::config("safe limit must be below the hard limit"));
        }
        if self.risky_bytes > self.hard_bytes {
            return Err(Error::config("risky limit must not exceed the hard limit"));
        }
        if self.risky_bytes < self.safe_bytes {
            return Err(Error::config("risky limit must not be below the safe limit"));
        }
        if self.document_only_bytes == 0 {
            return Err(Error::config("document-only threshold must be positive"));
        }
        Ok(())
    }
}

/// Weights of the UX-level risk heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Heights at or above this count as 4K.
    pub uhd_min_height: u32,
    pub uhd_boost: u32,
    /// Frame rates at or above this count as high.
    pub high_fps_min: u32,
    pub high_fps_boost: u32,
    pub alternate_container_boost: u32,
    pub low_compat_codec_boost: u32,
    /// Multiplier for container overhead when summing stream sizes.
    pub mux_overhead_factor: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            uhd_min_height: 2160,
            uhd_boost: 2,
            high_fps_min: 60,
            high_fps_boost: 2,
            alternate_container_boost: 1,
            low_compat_codec_boost: 1,
            mux_overhead_factor: 1.01,
        }
    }
}

impl RiskPolicy {
    pub fn boost(&self, height: u32, fps: u32, codec: VideoCodec, container: Container) -> u32 {
        let mut boost = 0;
        if height >= self.uhd_min_height {
            boost += self.uhd_boost;
        }
        if fps >= self.high_fps_min {
            boost += self.high_fps_boost;
        }
        if container != Container::Mp4 {
            boost += self.alternate_container_boost;
        }
        if codec.is_low_compatibility() {
            boost += self.low_compat_codec_boost;
        }
        boost
    }

    /// Apply the mux overhead to a raw byte sum.
    pub fn with_overhead(&self, bytes: u64) -> u64 {
        (bytes as f64 * self.mux_overhead_factor) as u64
    }

    /// Classify a choice by its estimated size and risk boost.
    pub fn classify(&self, estimated: Option<u64>, limits: &ChannelLimits, boost: u32) -> Availability {
        let Some(size) = estimated else {
            // Unknown size cannot be guaranteed, but is not blocked.
            return Availability::Risky;
        };
        if size > limits.hard_bytes {
            return Availability::Unavailable;
        }
        // Any boost at all takes a safe-size choice out of the guaranteed zone.
        if size <= limits.safe_bytes && boost == 0 {
            return Availability::Guaranteed;
        }
        Availability::Risky
    }

    pub fn validate(&self) -> Result<()> {
        if !self.mux_overhead_factor.is_finite() || self.mux_overhead_factor < 1.0 {
            return Err(Error::config("mux overhead factor must be >= 1.0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_valid() {
        let limits = ChannelLimits::default();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.hard_bytes, 2000 * MIB);
    }

    #[test]
    fn test_invalid_limits() {
        assert!(ChannelLimits::from_mib(900, 900, 900, 300).validate().is_err());
        assert!(ChannelLimits::from_mib(2000, 900, 2500, 300).validate().is_err());
        assert!(ChannelLimits::from_mib(2000, 900, 1500, 0).validate().is_err());
    }

    #[test]
    fn test_boost() {
        let p = RiskPolicy::default();
        assert_eq!(p.boost(1080, 30, VideoCodec::H264, Container::Mp4), 0);
        assert_eq!(p.boost(2160, 60, VideoCodec::Vp9, Container::Mkv), 6);
        assert_eq!(p.boost(1080, 60, VideoCodec::H264, Container::Mp4), 2);
    }

    #[test]
    fn test_classify() {
        let p = RiskPolicy::default();
        let limits = ChannelLimits::default();
        assert_eq!(p.classify(None, &limits, 0), Availability::Risky);
        assert_eq!(p.classify(Some(10 * MIB), &limits, 0), Availability::Guaranteed);
        assert_eq!(p.classify(Some(10 * MIB), &limits, 1), Availability::Risky);
        assert_eq!(p.classify(Some(10 * MIB), &limits, 4), Availability::Risky);
        assert_eq!(p.classify(Some(1200 * MIB), &limits, 0), Availability::Risky);
        assert_eq!(
            p.classify(Some(limits.hard_bytes + 1), &limits, 0),
            Availability::Unavailable
        );
    }

    #[test]
    fn test_any_boost_leaves_guaranteed_zone() {
        let p = RiskPolicy::default();
        let limits = ChannelLimits::default();
        let small = Some(limits.safe_bytes);
        assert_eq!(p.classify(small, &limits, 0), Availability::Guaranteed);
        for boost in 1..=6 {
            assert_eq!(p.classify(small, &limits, boost), Availability::Risky, "boost={boost}");
        }
        assert_eq!(p.classify(Some(limits.hard_bytes), &limits, 6), Availability::Risky);
    }

    #[test]
    fn test_classify_monotonic_in_size() {
        let p = RiskPolicy::default();
        let limits = ChannelLimits::default();
        for boost in 0..7 {
            let mut previous = Availability::Guaranteed;
            for mib in (0..2100).step_by(25) {
                let current = p.classify(Some(mib * MIB), &limits, boost);
                assert!(current.rank() >= previous.rank(), "boost={boost} size={mib}MiB");
                previous = current;
            }
        }
    }
}
