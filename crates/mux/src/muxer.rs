//! Segment muxer: one video track, an optional audio track, one fragment.
//!
//! Usage:
//! ```ignore
//! let mut muxer = SegmentMuxer::new(MuxerConfig::default());
//! muxer.init(video_source, Some(audio_source), false)?;
//! muxer.start(&StartParams::default())?;
//!
//! // Blocks until every track has reached end of segment
//! muxer.wait_for_eos();
//!
//! // Stops the tracks and serializes the segment
//! muxer.stop()?;
//! let segment = muxer.take_output();
//! ```
//!
//! Output layout:
//!
//! ```text
//! [ftyp][free][moov]                      (when write_init_header is set)
//! [styp][free:Xmta][sidx][moof][mdat]
//! ```

use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use dash_common::{MediaKind, MuxerConfig, Rotation, SampleSource, VideoCodec};

use crate::atoms::BoxWriter;
use crate::error::{MuxError, MuxResult};
use crate::mp4;
use crate::track::{EosBarrier, Track, TrackEvent};

/// Track id of the video track; audio follows it.
const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// Parameters for `SegmentMuxer::start`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StartParams {
    /// Producer-clock time the tracks should start at.
    pub start_time_us: i64,
    /// Video rotation hint: 0, 90, 180 or 270.
    pub rotation_degrees: i32,
    /// Interval between `TrackEvent::Progress` notifications; 0 disables them.
    pub progress_interval_us: i64,
}

/// Builds one fragmented-MP4 segment from live sample sources.
pub struct SegmentMuxer {
    config: MuxerConfig,
    video: Option<Track>,
    audio: Option<Track>,
    mute: bool,
    rotation: Rotation,
    barrier: Option<Arc<EosBarrier>>,
    started: bool,
    paused: bool,
    events: Option<Sender<TrackEvent>>,
    output: Option<Vec<u8>>,
}

impl SegmentMuxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            video: None,
            audio: None,
            mute: false,
            rotation: Rotation::Deg0,
            barrier: None,
            started: false,
            paused: false,
            events: None,
            output: None,
        }
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    /// Attach the sources. May be called once.
    ///
    /// `mute` is recorded in the segment's `Xmta` record.
    pub fn init(
        &mut self,
        video: Arc<dyn SampleSource>,
        audio: Option<Arc<dyn SampleSource>>,
        mute: bool,
    ) -> MuxResult<()> {
        if self.video.is_some() {
            return Err(MuxError::NotReady("Muxer already initialized".into()));
        }

        match video.format().media {
            MediaKind::Video {
                codec: VideoCodec::H264,
                ..
            } => {}
            other => {
                return Err(MuxError::Unsupported(format!(
                    "Video source must produce H.264, got {other:?}"
                )));
            }
        }
        if let Some(audio) = &audio {
            match audio.format().media {
                MediaKind::Audio { codec, .. } if codec.sample_entry().is_some() => {}
                other => {
                    return Err(MuxError::Unsupported(format!(
                        "Audio source must produce AAC or AMR, got {other:?}"
                    )));
                }
            }
        }

        let nal_length_size = self.config.nal_length_size;
        let video = Track::new(VIDEO_TRACK_ID, video, nal_length_size)?;
        let audio = audio
            .map(|source| Track::new(AUDIO_TRACK_ID, source, nal_length_size))
            .transpose()?;

        debug!(has_audio = audio.is_some(), mute, "Muxer initialized");
        self.video = Some(video);
        self.audio = audio;
        self.mute = mute;
        Ok(())
    }

    /// Forward worker notifications to `events`.
    ///
    /// Takes effect on the next `start`.
    pub fn set_event_sender(&mut self, events: Sender<TrackEvent>) {
        self.events = Some(events);
    }

    fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.video.iter().chain(self.audio.iter())
    }

    fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.video.iter_mut().chain(self.audio.iter_mut())
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks().count()
    }

    /// Start all tracks, or resume them after `pause`.
    ///
    /// If a track fails to start, the tracks already started are stopped
    /// and no segment is produced.
    pub fn start(&mut self, params: &StartParams) -> MuxResult<()> {
        if self.video.is_none() {
            return Err(MuxError::NotReady("Muxer started before init".into()));
        }

        if self.started && self.paused {
            let barrier = self
                .barrier
                .clone()
                .ok_or_else(|| MuxError::NotReady("Muxer has no active segment".into()))?;
            for track in self.tracks_mut() {
                track.start(params.start_time_us, &barrier)?;
            }
            self.paused = false;
            info!("Muxer resumed");
            return Ok(());
        }
        if self.started {
            return Err(MuxError::NotReady("Muxer already started".into()));
        }

        self.rotation = Rotation::from_degrees(params.rotation_degrees).ok_or_else(|| {
            MuxError::Unsupported(format!(
                "Rotation of {} degrees is not supported",
                params.rotation_degrees
            ))
        })?;

        let num_tracks = self.num_tracks();
        let lead_in = self.config.real_time && num_tracks > 1;
        let start_offset_us = self.config.start_offset_ms * 1000;
        let extra_audio_delay_us = self.config.extra_audio_delay_us;

        let barrier = Arc::new(EosBarrier::new(num_tracks));
        self.barrier = Some(Arc::clone(&barrier));
        self.output = None;

        let events = self.events.clone();
        let mut start_error = None;
        for track in self.tracks_mut() {
            let mut start_time_us = params.start_time_us;
            if lead_in {
                start_time_us += start_offset_us;
                if track.is_audio() {
                    start_time_us += extra_audio_delay_us;
                }
                debug!(
                    track_id = track.track_id(),
                    start_time_us,
                    "Applying start time offset"
                );
            }
            track.set_events(events.clone(), params.progress_interval_us);
            if let Err(e) = track.start(start_time_us, &barrier) {
                start_error = Some(e);
                break;
            }
        }
        if let Some(e) = start_error {
            warn!("Track failed to start, stopping the others: {e}");
            if let Some(stop_error) = self.stop_tracks() {
                debug!("Stopping started tracks: {stop_error}");
            }
            return Err(e);
        }
        self.started = true;

        info!(
            tracks = num_tracks,
            rotation = self.rotation.degrees(),
            "Muxer started"
        );
        Ok(())
    }

    /// Drop incoming samples until the next `start`.
    pub fn pause(&mut self) -> MuxResult<()> {
        if !self.started {
            return Err(MuxError::NotReady("Muxer paused before start".into()));
        }
        self.paused = true;
        for track in self.tracks() {
            track.pause();
        }
        debug!("Muxer paused");
        Ok(())
    }

    /// Block until every track has reached end of segment, or one failed.
    pub fn wait_for_eos(&self) {
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
    }

    /// Whether `wait_for_eos` would return immediately.
    pub fn reached_eos(&self) -> bool {
        self.barrier
            .as_ref()
            .is_some_and(|barrier| barrier.is_released())
    }

    /// Stop all tracks and, if they all stopped cleanly, write the segment.
    ///
    /// On any track error no segment is produced and the first error is
    /// returned.
    pub fn stop(&mut self) -> MuxResult<()> {
        if !self.started {
            return Err(MuxError::NotReady("Muxer stopped before start".into()));
        }
        self.started = false;
        self.paused = false;

        if let Some(e) = self.stop_tracks() {
            return Err(e);
        }

        let segment = self.write_segment()?;
        info!(
            bytes = segment.len(),
            duration_us = self.key_track_duration_us(),
            "Segment written"
        );
        self.output = Some(segment);
        Ok(())
    }

    /// Stop every started track, returning the first error.
    fn stop_tracks(&mut self) -> Option<MuxError> {
        let mut first_error = None;
        for track in self.tracks_mut() {
            if !track.is_started() {
                continue;
            }
            if let Err(e) = track.stop() {
                warn!(track_id = track.track_id(), "Track stopped with error: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    /// The finished segment, once `stop` succeeded.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.output.take()
    }

    /// Duration of the video track, the segment's nominal duration.
    pub fn key_track_duration_us(&self) -> i64 {
        self.video.as_ref().map_or(0, Track::duration_us)
    }

    pub fn video_track(&self) -> Option<&Track> {
        self.video.as_ref()
    }

    pub fn audio_track(&self) -> Option<&Track> {
        self.audio.as_ref()
    }

    fn write_segment(&self) -> MuxResult<Vec<u8>> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| MuxError::NotReady("Muxer has no video track".into()))?;

        let payload: usize = self
            .tracks()
            .map(|track| track.sample_count() * 8)
            .sum::<usize>();
        let mut writer = BoxWriter::with_capacity(4096 + payload);

        if self.config.write_init_header {
            self.write_header(&mut writer, video)?;
        }

        let segment_start = writer.position();
        mp4::write_styp(&mut writer)?;
        let mut offsets = mp4::write_xmta(&mut writer, self.mute)?;
        let video_ticks = u32::try_from(video.duration_ticks())
            .map_err(|_| MuxError::Malformed("Video duration overflows 32 bits".into()))?;
        let referenced_size =
            mp4::write_sidx(&mut writer, &mut offsets, video.time_scale(), video_ticks)?;

        let earliest_start_us = self
            .tracks()
            .filter_map(Track::start_timestamp_us)
            .min()
            .unwrap_or(0);

        let moof_offset = writer.position();
        writer.begin_box(b"moof");
        mp4::write_mfhd(&mut writer, &mut offsets)?;
        let mut data_offsets = Vec::with_capacity(2);
        for track in self.tracks() {
            let data_offset = track.write_traf(&mut writer, &mut offsets, earliest_start_us)?;
            data_offsets.push((track, data_offset));
        }
        writer.end_box()?;

        writer.begin_box(b"mdat");
        for (track, data_offset) in data_offsets {
            track.write_mdat_payload(&mut writer, data_offset, moof_offset)?;
        }
        writer.end_box()?;

        let segment_size = u32::try_from(writer.position() - segment_start)
            .map_err(|_| MuxError::Malformed("Segment exceeds 32-bit size".into()))?;
        writer.resolve(referenced_size, segment_size);
        offsets.finish(&mut writer);

        debug!(
            segment_size,
            video_samples = video.sample_count(),
            audio_samples = self.audio.as_ref().map_or(0, Track::sample_count),
            "Fragment assembled"
        );
        Ok(writer.finish())
    }

    fn write_header(&self, writer: &mut BoxWriter, video: &Track) -> MuxResult<()> {
        mp4::write_ftyp(writer)?;
        mp4::write_free(writer)?;

        writer.begin_box(b"moov");
        mp4::write_mvhd(writer, self.num_tracks() as u32)?;

        writer.begin_box(b"mvex");
        let duration_ms = u32::try_from(video.duration_us() / 1000)
            .map_err(|_| MuxError::Malformed("Video duration overflows 32 bits".into()))?;
        mp4::write_mehd(writer, duration_ms)?;
        for track in self.tracks() {
            mp4::write_trex(
                writer,
                track.track_id(),
                track.default_sample_duration(),
                track.is_audio(),
            )?;
        }
        for track in self.tracks() {
            mp4::write_trep(writer, track.track_id())?;
        }
        writer.end_box()?;

        for track in self.tracks() {
            track.write_trak(writer, self.rotation)?;
        }
        writer.end_box()
    }
}

impl std::fmt::Debug for SegmentMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMuxer")
            .field("tracks", &self.num_tracks())
            .field("started", &self.started)
            .field("paused", &self.paused)
            .field("mute", &self.mute)
            .finish()
    }
}
