//! Encoded access units as delivered by an upstream encoder.

/// One encoded access unit.
///
/// Ownership moves from the producer to the consuming track on `read()`;
/// the track keeps the payload until it is serialized into a segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    /// Payload. For H.264 this is Annex-B (start-code delimited) data.
    pub data: Vec<u8>,
    /// Presentation timestamp in producer-clock microseconds.
    pub pts_us: i64,
    /// Decode timestamp in microseconds (video only).
    pub dts_us: Option<i64>,
    /// Sync (key) frame.
    pub is_sync: bool,
    /// Out-of-band codec configuration (SPS/PPS, AudioSpecificConfig).
    pub is_codec_config: bool,
    /// Capture clock drift reported by the audio encoder, in microseconds.
    pub drift_us: Option<i64>,
}

impl Sample {
    /// A regular media sample.
    pub fn new(data: Vec<u8>, pts_us: i64) -> Self {
        Self {
            data,
            pts_us,
            ..Self::default()
        }
    }

    /// A codec configuration sample.
    pub fn codec_config(data: Vec<u8>, pts_us: i64) -> Self {
        Self {
            data,
            pts_us,
            is_codec_config: true,
            ..Self::default()
        }
    }

    pub fn with_sync(mut self, is_sync: bool) -> Self {
        self.is_sync = is_sync;
        self
    }

    pub fn with_dts(mut self, dts_us: i64) -> Self {
        self.dts_us = Some(dts_us);
        self
    }

    pub fn with_drift(mut self, drift_us: i64) -> Self {
        self.drift_us = Some(drift_us);
        self
    }

    /// Timestamp used for decode ordering: DTS when present, else PTS.
    pub fn decode_time_us(&self) -> i64 {
        self.dts_us.unwrap_or(self.pts_us)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
