//! Segmentation loop: cuts live encoder output into key-frame aligned
//! segments, one `SegmentMuxer` per segment.
//!
//! # Architecture
//!
//! ```text
//! SegmentationLoop::spawn()
//!   |
//!   +-- Spawn segmenter thread
//!   |     |
//!   |     +-- loop:
//!   |     |     1. Wrap the encoders in fresh Video/AudioSegmenters
//!   |     |     2. muxer.init() + muxer.start()
//!   |     |     3. muxer.wait_for_eos()  (next key frame reached)
//!   |     |     4. muxer.stop() -> segment bytes
//!   |     |     5. sink.send(segment)
//!   |     |
//!   |     +-- exits on shutdown, encoder end of stream, or a fatal error
//!   |
//!   +-- Returns SegmenterHandle (mute / shutdown)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use dash_common::{
    HeaderMode, MuxerConfig, SampleSource, Segment, SegmentSink, SegmentTag, SegmenterConfig,
};
use dash_mux::{SegmentMuxer, StartParams, Track};

use crate::audio::AudioSegmenter;
use crate::error::SegmenterError;
use crate::progress::VideoProgress;
use crate::putback::PutBackSource;
use crate::video::VideoSegmenter;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Flags shared between the segmenter thread and its handle.
#[derive(Debug, Default)]
struct LoopShared {
    mute: AtomicBool,
    shutdown: AtomicBool,
    running: AtomicBool,
    segments_sent: AtomicU64,
}

impl LoopShared {
    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Segmentation loop
// ---------------------------------------------------------------------------

/// Produces segments from a live video encoder and an optional audio
/// encoder until shut down.
pub struct SegmentationLoop {
    config: SegmenterConfig,
    video: Arc<PutBackSource>,
    audio: Option<Arc<PutBackSource>>,
    sink: Arc<dyn SegmentSink>,
    shared: Arc<LoopShared>,
}

impl SegmentationLoop {
    pub fn new(
        config: SegmenterConfig,
        video: Arc<dyn SampleSource>,
        audio: Option<Arc<dyn SampleSource>>,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<Self, SegmenterError> {
        if !video.format().is_video() {
            return Err(SegmenterError::InvalidSource(
                "video source does not produce video".into(),
            ));
        }
        if let Some(audio) = &audio {
            let format = audio.format();
            if !format.is_audio() || format.sample_rate().unwrap_or(0) == 0 {
                return Err(SegmenterError::InvalidSource(format!(
                    "audio source has unusable format {:?}",
                    format.media
                )));
            }
        }
        if config.audio_samples_per_frame == 0 {
            return Err(SegmenterError::InvalidSource(
                "audio frames must carry at least one sample".into(),
            ));
        }

        Ok(Self {
            config,
            video: Arc::new(PutBackSource::new(video)),
            audio: audio.map(|source| Arc::new(PutBackSource::new(source))),
            sink,
            shared: Arc::new(LoopShared::default()),
        })
    }

    /// Set the mute flag recorded in segments started after this call.
    pub fn set_mute(&self, mute: bool) {
        self.shared.mute.store(mute, Ordering::Release);
    }

    /// Start the loop on its own thread.
    pub fn spawn(self) -> Result<SegmenterHandle, SegmenterError> {
        let shared = Arc::clone(&self.shared);
        let video = Arc::clone(&self.video);
        let audio = self.audio.clone();

        shared.running.store(true, Ordering::Release);
        let thread = std::thread::Builder::new()
            .name("dash-segmenter".to_string())
            .spawn(move || self.run())
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                SegmenterError::Spawn(e.to_string())
            })?;

        Ok(SegmenterHandle {
            thread: Some(thread),
            shared,
            video,
            audio,
        })
    }

    /// The loop body (runs on the segmenter thread).
    fn run(self) {
        info!(
            has_audio = self.audio.is_some(),
            header_mode = ?self.config.header_mode,
            "Segmentation loop started"
        );

        let mut built: u64 = 0;
        let mut header_sent = false;

        while !self.shared.shutdown_requested() {
            let write_header = match self.config.header_mode {
                HeaderMode::EverySegment => true,
                HeaderMode::FirstSegment => !header_sent,
            };

            match self.build_segment(write_header) {
                Ok(Some(segment)) => {
                    built += 1;
                    if self.shared.shutdown_requested() {
                        debug!("Dropping segment finished during shutdown");
                        break;
                    }
                    if built == 1 && self.config.discard_first_segment {
                        debug!(
                            duration_ms = segment.duration_ms,
                            "Discarding first segment"
                        );
                    } else {
                        header_sent |= write_header;
                        debug!(
                            duration_ms = segment.duration_ms,
                            bytes = segment.data.len(),
                            "Sending segment"
                        );
                        self.sink.send(segment);
                        self.shared.segments_sent.fetch_add(1, Ordering::AcqRel);
                    }
                }
                Ok(None) => debug!("Segment has no video, nothing to send"),
                Err(_) if self.shared.shutdown_requested() => break,
                Err(SegmenterError::Mux(e)) if e.is_recoverable() => {
                    warn!("Segment failed, starting a new one: {e}");
                }
                Err(e) => {
                    error!("Segmentation loop stopped: {e}");
                    break;
                }
            }

            if self.video.is_exhausted() {
                info!("Video encoder reached end of stream");
                break;
            }
        }

        self.shared.running.store(false, Ordering::Release);
        info!(
            built,
            sent = self.shared.segments_sent.load(Ordering::Acquire),
            "Segmentation loop finished"
        );
    }

    /// Record one segment, from the key frame at the head of the video
    /// stream up to the next one.
    fn build_segment(&self, write_header: bool) -> Result<Option<Segment>, SegmenterError> {
        let progress = Arc::new(VideoProgress::new());
        let video: Arc<dyn SampleSource> = Arc::new(VideoSegmenter::new(
            Arc::clone(&self.video),
            Arc::clone(&progress),
            self.config.mask_second_key_frame,
        ));
        let audio = match &self.audio {
            Some(source) => Some(Arc::new(AudioSegmenter::new(
                Arc::clone(source),
                Arc::clone(&progress),
                self.config.audio_samples_per_frame,
            )?) as Arc<dyn SampleSource>),
            None => None,
        };

        let mut muxer = SegmentMuxer::new(MuxerConfig {
            write_init_header: write_header,
            ..self.config.muxer.clone()
        });
        muxer.init(video, audio, self.shared.mute.load(Ordering::Acquire))?;

        let when = SystemTime::now();
        muxer.start(&StartParams::default())?;
        muxer.wait_for_eos();
        muxer.stop()?;

        let frames = muxer.video_track().map_or(0, Track::sample_count);
        let duration_ms = muxer.key_track_duration_us() / 1000;
        match muxer.take_output() {
            Some(data) if frames > 0 => Ok(Some(Segment {
                tag: SegmentTag::Video,
                when,
                duration_ms,
                data,
            })),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control handle for a running segmentation loop.
///
/// Dropping the handle shuts the loop down.
pub struct SegmenterHandle {
    thread: Option<JoinHandle<()>>,
    shared: Arc<LoopShared>,
    video: Arc<PutBackSource>,
    audio: Option<Arc<PutBackSource>>,
}

impl SegmenterHandle {
    /// Set the mute flag recorded in segments started after this call.
    pub fn set_mute(&self, mute: bool) {
        self.shared.mute.store(mute, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Segments handed to the sink so far.
    pub fn segments_sent(&self) -> u64 {
        self.shared.segments_sent.load(Ordering::Acquire)
    }

    /// Wait for the loop to finish on its own, e.g. after the video
    /// encoder reached end of stream.
    pub fn join(mut self) {
        self.join_thread();
    }

    /// Stop the encoders and wait for the loop to exit.
    ///
    /// The segment in progress is discarded.
    pub fn shutdown(&mut self) {
        if self.thread.is_none() {
            return;
        }
        info!("Shutting down segmentation loop");
        self.shared.shutdown.store(true, Ordering::Release);

        if let Err(e) = self.video.stop() {
            warn!("Failed to stop video encoder: {e}");
        }
        if let Some(audio) = &self.audio {
            if let Err(e) = audio.stop() {
                warn!("Failed to stop audio encoder: {e}");
            }
        }
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Segmenter thread panicked");
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for SegmenterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
