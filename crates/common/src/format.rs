//! Stream format reported by a sample source.

use serde::{Deserialize, Serialize};

use crate::codec::{AudioCodec, VideoCodec};

/// What kind of elementary stream a source produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
    },
}

/// Codec configuration carried in the format rather than in-band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormatCodecData {
    /// An `AVCDecoderConfigurationRecord`.
    AvcC(Vec<u8>),
    /// The payload of an `esds` box (ES_Descriptor and children).
    Esds(Vec<u8>),
}

/// Format of a sample source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFormat {
    pub media: MediaKind,
    /// Track clock override. Defaults to 90000 for video and the sample
    /// rate for audio.
    pub time_scale: Option<u32>,
    pub codec_data: Option<FormatCodecData>,
}

impl SourceFormat {
    pub fn video(codec: VideoCodec, width: u32, height: u32) -> Self {
        Self {
            media: MediaKind::Video {
                codec,
                width,
                height,
            },
            time_scale: None,
            codec_data: None,
        }
    }

    pub fn audio(codec: AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            media: MediaKind::Audio {
                codec,
                sample_rate,
                channels,
            },
            time_scale: None,
            codec_data: None,
        }
    }

    pub fn with_time_scale(mut self, time_scale: u32) -> Self {
        self.time_scale = Some(time_scale);
        self
    }

    pub fn with_codec_data(mut self, data: FormatCodecData) -> Self {
        self.codec_data = Some(data);
        self
    }

    pub fn is_video(&self) -> bool {
        matches!(self.media, MediaKind::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.media, MediaKind::Audio { .. })
    }

    /// Sample rate of an audio stream.
    pub fn sample_rate(&self) -> Option<u32> {
        match self.media {
            MediaKind::Audio { sample_rate, .. } => Some(sample_rate),
            MediaKind::Video { .. } => None,
        }
    }
}
