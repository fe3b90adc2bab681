//! Configuration structs for the segment muxer and the segmentation loop.

use serde::{Deserialize, Serialize};

/// Width of the length prefix written in front of each H.264 NAL unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NalLengthSize {
    Two,
    #[default]
    Four,
}

impl NalLengthSize {
    pub fn bytes(self) -> usize {
        match self {
            Self::Two => 2,
            Self::Four => 4,
        }
    }
}

/// Segment muxer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub nal_length_size: NalLengthSize,
    /// Warm-up lead-in added to every track's start time.
    pub start_offset_ms: i64,
    /// Additional lead-in for the audio track.
    pub extra_audio_delay_us: i64,
    /// Live pacing. Start offsets only apply to real-time multi-track muxing.
    pub real_time: bool,
    /// Prefix the segment with `ftyp`/`free`/`moov`.
    pub write_init_header: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            nal_length_size: NalLengthSize::Four,
            start_offset_ms: 700,
            extra_audio_delay_us: 200_000,
            real_time: true,
            write_init_header: true,
        }
    }
}

/// When the segmentation loop writes the `ftyp`/`moov` header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderMode {
    /// Every segment is independently playable.
    #[default]
    EverySegment,
    /// Only the first emitted segment carries the header.
    FirstSegment,
}

/// Segmentation loop configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub muxer: MuxerConfig,
    pub header_mode: HeaderMode,
    /// PCM samples per encoded audio frame (1024 for AAC).
    pub audio_samples_per_frame: u32,
    /// Let a key frame that arrives as a segment's second frame through.
    pub mask_second_key_frame: bool,
    /// Drop the first segment after the loop starts.
    pub discard_first_segment: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            muxer: MuxerConfig::default(),
            header_mode: HeaderMode::EverySegment,
            audio_samples_per_frame: 1024,
            mask_second_key_frame: false,
            discard_first_segment: true,
        }
    }
}
