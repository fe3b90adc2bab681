//! Video/audio codec enums and the ISO-BMFF sample entry each maps to.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Human readable name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }
}

/// Audio codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    AmrNb,
    AmrWb,
    Opus,
}

impl AudioCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aac => "AAC",
            Self::AmrNb => "AMR-NB",
            Self::AmrWb => "AMR-WB",
            Self::Opus => "Opus",
        }
    }

    /// Sample entry fourcc used in `stsd`, or `None` when the segment
    /// writer cannot describe this codec.
    pub fn sample_entry(self) -> Option<&'static [u8; 4]> {
        match self {
            Self::Aac => Some(b"mp4a"),
            Self::AmrNb => Some(b"samr"),
            Self::AmrWb => Some(b"sawb"),
            Self::Opus => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(AudioCodec::AmrWb.display_name(), "AMR-WB");
    }

    #[test]
    fn audio_sample_entries() {
        assert_eq!(AudioCodec::Aac.sample_entry(), Some(b"mp4a"));
        assert_eq!(AudioCodec::AmrNb.sample_entry(), Some(b"samr"));
        assert_eq!(AudioCodec::AmrWb.sample_entry(), Some(b"sawb"));
        assert!(AudioCodec::Opus.sample_entry().is_none());
    }
}
