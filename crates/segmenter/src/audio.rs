//! Audio view of one segment, paced by video progress.
//!
//! Audio is only read while video has progressed at least as far as the
//! audio read so far. Once video reports the exact segment boundary, audio
//! keeps reading until it covers the boundary, so every segment's audio
//! ends at or after its video.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use dash_common::{Sample, SampleSource, SourceError, SourceFormat, SourceResult, SourceStartParams};

use crate::error::SegmenterError;
use crate::progress::{ProgressWait, VideoProgress};
use crate::putback::PutBackSource;

#[derive(Debug, Default)]
struct AudioState {
    /// End of the audio read so far.
    read_time_us: i64,
    /// Replayed at the start of the next segment.
    codec_config: Option<Sample>,
}

/// Audio source for one segment.
pub struct AudioSegmenter {
    source: Arc<PutBackSource>,
    progress: Arc<VideoProgress>,
    frame_duration_us: i64,
    state: Mutex<AudioState>,
}

impl AudioSegmenter {
    pub fn new(
        source: Arc<PutBackSource>,
        progress: Arc<VideoProgress>,
        samples_per_frame: u32,
    ) -> Result<Self, SegmenterError> {
        let sample_rate = source
            .format()
            .sample_rate()
            .filter(|&rate| rate > 0)
            .ok_or_else(|| SegmenterError::InvalidSource("audio source has no sample rate".into()))?;
        let frame_duration_us = i64::from(samples_per_frame) * 1_000_000 / i64::from(sample_rate);
        Ok(Self {
            source,
            progress,
            frame_duration_us,
            state: Mutex::new(AudioState::default()),
        })
    }

    /// End this segment's audio, replaying the codec config next time.
    fn end_segment(&self, state: &mut AudioState) -> SourceError {
        match state.codec_config.take() {
            Some(config) => self.source.put_back(config),
            None => debug!("No audio codec config to replay"),
        }
        SourceError::EndOfStream
    }
}

/// A segment that failed mid-read never reaches `end_segment`; its config
/// still has to open the next one.
impl Drop for AudioSegmenter {
    fn drop(&mut self) {
        if let Some(config) = self.state.get_mut().codec_config.take() {
            debug!("Replaying audio codec config from an unfinished segment");
            self.source.put_back(config);
        }
    }
}

impl SampleSource for AudioSegmenter {
    fn format(&self) -> SourceFormat {
        self.source.format()
    }

    fn start(&self, params: &SourceStartParams) -> SourceResult<()> {
        self.source.start(params)
    }

    /// Releases a pending read; leaves the encoder running.
    fn stop(&self) -> SourceResult<()> {
        self.progress.cancel();
        Ok(())
    }

    fn read(&self) -> SourceResult<Sample> {
        let read_time_us = self.state.lock().read_time_us;

        trace!(read_time_us, "Waiting for video progress");
        match self.progress.wait_until(read_time_us) {
            ProgressWait::Cancelled => {
                return Err(self.end_segment(&mut self.state.lock()));
            }
            ProgressWait::Reached(progress)
                if progress.is_end_of_segment() && read_time_us >= progress.time_us =>
            {
                debug!(
                    boundary_us = progress.time_us,
                    read_time_us, "Audio segment complete"
                );
                return Err(self.end_segment(&mut self.state.lock()));
            }
            ProgressWait::Reached(_) => {}
        }

        let sample = self.source.read().inspect_err(|e| {
            if !e.is_end_of_stream() {
                warn!("Unexpected error from audio encoder: {e}");
            }
        })?;

        let mut state = self.state.lock();
        if sample.is_codec_config {
            state.codec_config = Some(sample.clone());
            return Ok(sample);
        }

        let start_us = sample.pts_us + sample.drift_us.unwrap_or(0);
        state.read_time_us = start_us + self.frame_duration_us;
        Ok(sample)
    }
}
