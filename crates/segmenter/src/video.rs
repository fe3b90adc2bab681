//! Key-frame delimited view of the video encoder.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use dash_common::{
    FormatCodecData, NalLengthSize, Sample, SampleSource, SourceError, SourceFormat, SourceResult,
    SourceStartParams,
};
use dash_mux::AvcConfig;

use crate::progress::{ProgressKind, VideoProgress};
use crate::putback::PutBackSource;

#[derive(Debug, Default)]
struct VideoState {
    first_key_frame_sent: bool,
    frame_count: u32,
}

/// Video source for one segment.
///
/// Passes frames through from the segment's opening key frame up to, not
/// including, the next key frame. That frame is put back and the read
/// reports end of stream.
pub struct VideoSegmenter {
    source: Arc<PutBackSource>,
    progress: Arc<VideoProgress>,
    mask_second_key_frame: bool,
    state: Mutex<VideoState>,
}

impl VideoSegmenter {
    pub fn new(
        source: Arc<PutBackSource>,
        progress: Arc<VideoProgress>,
        mask_second_key_frame: bool,
    ) -> Self {
        Self {
            source,
            progress,
            mask_second_key_frame,
            state: Mutex::new(VideoState::default()),
        }
    }

    /// Keep the in-band config for later segments, which never see it.
    fn cache_codec_config(&self, sample: &Sample) {
        match AvcConfig::from_annex_b(&sample.data) {
            Ok(config) => {
                debug!(
                    profile = config.profile_idc,
                    level = config.level_idc,
                    "Caching AVC codec config"
                );
                self.source.set_codec_data(FormatCodecData::AvcC(
                    config.to_record(NalLengthSize::default()),
                ));
            }
            Err(e) => warn!("Unable to build avcC from AVC codec config: {e}"),
        }
    }
}

impl SampleSource for VideoSegmenter {
    fn format(&self) -> SourceFormat {
        self.source.format()
    }

    fn start(&self, params: &SourceStartParams) -> SourceResult<()> {
        self.source.start(params)
    }

    /// Leaves the encoder running for the next segment.
    fn stop(&self) -> SourceResult<()> {
        Ok(())
    }

    fn read(&self) -> SourceResult<Sample> {
        loop {
            let sample = match self.source.read() {
                Ok(sample) => sample,
                Err(e) => {
                    if !e.is_end_of_stream() {
                        warn!("Unexpected error from video encoder: {e}");
                    }
                    // Nothing else will end the audio side of this segment.
                    self.progress.cancel();
                    return Err(e);
                }
            };

            if sample.is_codec_config {
                self.cache_codec_config(&sample);
                return Ok(sample);
            }

            let mut state = self.state.lock();
            if !sample.is_sync && !state.first_key_frame_sent {
                trace!(pts_us = sample.pts_us, "Dropping frame before first key frame");
                continue;
            }
            state.frame_count += 1;

            if sample.is_sync {
                if !state.first_key_frame_sent {
                    state.first_key_frame_sent = true;
                    self.progress.notify(sample.pts_us, ProgressKind::KeyFrame);
                    return Ok(sample);
                }
                if self.mask_second_key_frame && state.frame_count == 2 {
                    warn!("Masking unexpected key frame at frame #2");
                    self.progress.notify(sample.pts_us, ProgressKind::Frame);
                    return Ok(sample);
                }
                drop(state);

                let boundary_us = sample.pts_us;
                self.source.put_back(sample);
                self.progress.notify(boundary_us, ProgressKind::EndOfSegment);
                debug!(boundary_us, "Video segment complete");
                return Err(SourceError::EndOfStream);
            }

            self.progress.notify(sample.pts_us, ProgressKind::Frame);
            return Ok(sample);
        }
    }
}
