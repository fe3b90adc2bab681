//! One elementary stream of a segment.
//!
//! A `Track` pulls samples from its `SampleSource` on a dedicated thread,
//! rescales their timestamps to the track's time scale and buffers them
//! until the muxer serializes the segment. The buffered state is owned by
//! the worker thread while it runs and handed back on `stop`, so the box
//! writers never race the producer.
//!
//! # Timing
//!
//! Each sample's duration is only known once the next sample arrives:
//!
//! ```text
//! duration[i] = ticks(t[i+1]) - ticks(t[i])
//! ```
//!
//! where `ticks` rounds to the nearest tick. Rounding each timestamp
//! (instead of each difference) keeps the error from accumulating. The last
//! sample of a segment repeats the previous duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use dash_common::{
    AudioCodec, FormatCodecData, MediaKind, NalLengthSize, Rotation, Sample, SampleSource,
    SourceError, SourceStartParams, TimeScale, VideoCodec,
};

use crate::atoms::{BoxWriter, Stash};
use crate::avc::{annexb_to_length_prefixed, AvcConfig};
use crate::error::{MuxError, MuxResult};
use crate::esds::decoder_specific_info;
use crate::mp4::{self, XmtaOffsets};

// ---------------------------------------------------------------------------
// Shared control state
// ---------------------------------------------------------------------------

/// Flags shared between a track and its worker thread.
#[derive(Debug, Default)]
pub(crate) struct TrackControl {
    done: AtomicBool,
    paused: AtomicBool,
    resumed: AtomicBool,
    reached_eos: AtomicBool,
}

impl TrackControl {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Consume the one-shot resume flag.
    fn take_resumed(&self) -> bool {
        self.resumed.swap(false, Ordering::AcqRel)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumed.store(true, Ordering::Release);
    }
}

/// Joint end-of-segment barrier for all tracks of one muxer.
///
/// Released when every track has finished, or as soon as one fails.
#[derive(Debug)]
pub(crate) struct EosBarrier {
    state: Mutex<EosState>,
    finished: Condvar,
}

#[derive(Debug)]
struct EosState {
    pending: usize,
    failed: bool,
}

impl EosBarrier {
    pub(crate) fn new(tracks: usize) -> Self {
        Self {
            state: Mutex::new(EosState {
                pending: tracks,
                failed: false,
            }),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn track_finished(&self, ok: bool) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        state.failed |= !ok;
        self.finished.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while state.pending > 0 && !state.failed {
            self.finished.wait(&mut state);
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        let state = self.state.lock();
        state.pending == 0 || state.failed
    }
}

/// Signals the barrier exactly once, including when the worker unwinds.
struct EosSignal {
    barrier: Arc<EosBarrier>,
    ok: bool,
}

impl Drop for EosSignal {
    fn drop(&mut self) {
        self.barrier.track_finished(self.ok);
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress notifications sent by track workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackEvent {
    /// The track has buffered media up to `duration_us`.
    Progress { track_id: u32, duration_us: i64 },
    /// The worker finished cleanly.
    Completed {
        track_id: u32,
        duration_us: i64,
        samples: usize,
    },
    /// The worker stopped on an error; the segment will be dropped.
    Failed { track_id: u32, error: String },
}

// ---------------------------------------------------------------------------
// Per-segment sample state
// ---------------------------------------------------------------------------

/// Out-of-band decoder configuration of a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecSpecificData {
    Avc(AvcConfig),
    /// AudioSpecificConfig bytes for AAC.
    Audio(Vec<u8>),
}

/// A buffered sample, ready for `mdat`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct TrackSample {
    /// Payload; length-prefixed NAL units for AVC.
    data: Vec<u8>,
    duration_ticks: u32,
}

/// Sample ingestion and duration accounting for one track.
///
/// Runs on the worker thread; owned by the `Track` again once stopped.
#[derive(Debug)]
struct SampleIngest {
    track_id: u32,
    is_avc: bool,
    time_scale: TimeScale,
    nal_length_size: NalLengthSize,
    control: Arc<TrackControl>,
    codec_data: Option<CodecSpecificData>,
    samples: Vec<TrackSample>,
    start_timestamp_us: Option<i64>,
    previous_paused_us: i64,
    last_timestamp_us: i64,
    last_duration_us: i64,
    last_duration_ticks: i64,
    duration_us: i64,
    duration_ticks: i64,
    empty_samples: usize,
    events: Option<Sender<TrackEvent>>,
    progress_interval_us: i64,
    last_progress_us: i64,
}

impl SampleIngest {
    fn new(
        track_id: u32,
        is_avc: bool,
        time_scale: TimeScale,
        nal_length_size: NalLengthSize,
        control: Arc<TrackControl>,
        codec_data: Option<CodecSpecificData>,
    ) -> Self {
        Self {
            track_id,
            is_avc,
            time_scale,
            nal_length_size,
            control,
            codec_data,
            samples: Vec::new(),
            start_timestamp_us: None,
            previous_paused_us: 0,
            last_timestamp_us: 0,
            last_duration_us: 0,
            last_duration_ticks: 0,
            duration_us: 0,
            duration_ticks: 0,
            empty_samples: 0,
            events: None,
            progress_interval_us: 0,
            last_progress_us: 0,
        }
    }

    fn name(&self) -> &'static str {
        if self.is_avc {
            "video"
        } else {
            "audio"
        }
    }

    fn push(&mut self, sample: Sample) -> MuxResult<()> {
        if sample.is_empty() {
            self.empty_samples += 1;
            return Ok(());
        }

        if sample.is_codec_config {
            return self.set_codec_config(&sample.data);
        }

        if self.control.is_paused() {
            trace!(track = self.name(), pts_us = sample.pts_us, "Dropping sample while paused");
            return Ok(());
        }

        let decode_time_us = sample.decode_time_us();
        let mut timestamp_us = sample.pts_us;
        let data = if self.is_avc {
            annexb_to_length_prefixed(&sample.data, self.nal_length_size)?
        } else {
            sample.data
        };

        if self.start_timestamp_us.is_none() {
            self.start_timestamp_us = Some(timestamp_us);
            self.previous_paused_us = timestamp_us;
        }

        if self.control.take_resumed() {
            let elapsed_us = timestamp_us - self.previous_paused_us;
            if elapsed_us < 0 {
                return Err(self.malformed(format!(
                    "resumed at {timestamp_us}us, before the previous pause point"
                )));
            }
            let paused_us = elapsed_us - self.duration_us;
            if paused_us < self.last_duration_us {
                return Err(self.malformed(format!(
                    "paused for {paused_us}us, shorter than one sample ({}us)",
                    self.last_duration_us
                )));
            }
            self.previous_paused_us += paused_us - self.last_duration_us;
            debug!(
                track = self.name(),
                paused_us,
                previous_paused_us = self.previous_paused_us,
                "Resumed after pause"
            );
        }

        timestamp_us -= self.previous_paused_us;
        if self.is_avc {
            timestamp_us = decode_time_us - self.previous_paused_us;
        }
        if timestamp_us < 0 {
            return Err(self.malformed(format!("negative timestamp {timestamp_us}us")));
        }

        if timestamp_us > self.duration_us {
            self.duration_us = timestamp_us;
            self.duration_ticks = self.time_scale.ticks(timestamp_us);
        }

        let duration_ticks =
            self.time_scale.ticks(timestamp_us) - self.time_scale.ticks(self.last_timestamp_us);
        if duration_ticks < 0 {
            return Err(self.malformed(format!(
                "timestamp {timestamp_us}us precedes previous sample at {}us",
                self.last_timestamp_us
            )));
        }
        if let Some(previous) = self.samples.last_mut() {
            previous.duration_ticks = u32::try_from(duration_ticks)
                .map_err(|_| MuxError::Malformed("Sample duration overflows 32 bits".into()))?;
        }
        self.samples.push(TrackSample {
            data,
            duration_ticks: 0,
        });

        self.last_duration_us = timestamp_us - self.last_timestamp_us;
        self.last_duration_ticks = duration_ticks;
        self.last_timestamp_us = timestamp_us;

        self.report_progress(timestamp_us);
        Ok(())
    }

    fn set_codec_config(&mut self, data: &[u8]) -> MuxResult<()> {
        let config = if self.is_avc {
            CodecSpecificData::Avc(AvcConfig::from_annex_b(data)?)
        } else {
            CodecSpecificData::Audio(data.to_vec())
        };
        if self.codec_data.as_ref().is_some_and(|current| *current != config) {
            debug!(track = self.name(), "Replacing codec specific data");
        }
        self.codec_data = Some(config);
        Ok(())
    }

    /// Close the segment: the last sample repeats the previous duration.
    fn finish(&mut self) {
        if self.samples.len() == 1 {
            self.last_duration_us = 0;
            self.last_duration_ticks = 0;
        }
        if let Some(last) = self.samples.last_mut() {
            // Bounded by the previous sample's duration, which already fit.
            last.duration_ticks = self.last_duration_ticks as u32;
        }
        self.duration_us += self.last_duration_us;
        self.duration_ticks += self.last_duration_ticks;
    }

    fn malformed(&self, detail: String) -> MuxError {
        MuxError::Malformed(format!("{} track: {detail}", self.name()))
    }

    fn report_progress(&mut self, timestamp_us: i64) {
        let Some(events) = &self.events else {
            return;
        };
        if self.progress_interval_us > 0
            && timestamp_us - self.last_progress_us >= self.progress_interval_us
        {
            let _ = events.try_send(TrackEvent::Progress {
                track_id: self.track_id,
                duration_us: timestamp_us,
            });
            self.last_progress_us = timestamp_us;
        }
    }

    fn report_finished(&self, result: &MuxResult<()>) {
        let Some(events) = &self.events else {
            return;
        };
        let event = match result {
            Ok(()) => TrackEvent::Completed {
                track_id: self.track_id,
                duration_us: self.duration_us,
                samples: self.samples.len(),
            },
            Err(e) => TrackEvent::Failed {
                track_id: self.track_id,
                error: e.to_string(),
            },
        };
        let _ = events.try_send(event);
    }
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum TrackMedia {
    Avc {
        width: u32,
        height: u32,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
    },
}

type WorkerResult = (SampleIngest, MuxResult<()>);

/// One video or audio track of a segment muxer.
pub struct Track {
    track_id: u32,
    source: Arc<dyn SampleSource>,
    media: TrackMedia,
    time_scale: TimeScale,
    nal_length_size: NalLengthSize,
    control: Arc<TrackControl>,
    /// Present unless the worker thread holds it.
    ingest: Option<SampleIngest>,
    worker: Option<JoinHandle<WorkerResult>>,
    started: bool,
    events: Option<Sender<TrackEvent>>,
    progress_interval_us: i64,
}

impl Track {
    /// Create a track for `source`, reading its format once.
    pub fn new(
        track_id: u32,
        source: Arc<dyn SampleSource>,
        nal_length_size: NalLengthSize,
    ) -> MuxResult<Self> {
        let format = source.format();
        let (media, default_scale) = match format.media {
            MediaKind::Video {
                codec: VideoCodec::H264,
                width,
                height,
            } => (TrackMedia::Avc { width, height }, TimeScale::VIDEO.as_u32()),
            MediaKind::Video { codec, .. } => {
                return Err(MuxError::Unsupported(format!(
                    "Video codec {} is not supported",
                    codec.display_name()
                )));
            }
            MediaKind::Audio {
                codec,
                sample_rate,
                channels,
            } => (
                TrackMedia::Audio {
                    codec,
                    sample_rate,
                    channels,
                },
                sample_rate,
            ),
        };

        let time_scale = TimeScale(format.time_scale.unwrap_or(default_scale));
        if time_scale.as_u32() == 0 {
            return Err(MuxError::Malformed(format!(
                "Track {track_id} time scale must be > 0"
            )));
        }

        let is_avc = matches!(media, TrackMedia::Avc { .. });
        let codec_data = match (format.codec_data, is_avc) {
            (None, _) => None,
            (Some(FormatCodecData::AvcC(record)), true) => {
                Some(CodecSpecificData::Avc(AvcConfig::from_record(&record)?))
            }
            (Some(FormatCodecData::Esds(esds)), false) => {
                Some(CodecSpecificData::Audio(decoder_specific_info(&esds)?))
            }
            (Some(other), _) => {
                return Err(MuxError::Malformed(format!(
                    "Track {track_id} format carries mismatched codec data {other:?}"
                )));
            }
        };

        let control = Arc::new(TrackControl::default());
        let ingest = SampleIngest::new(
            track_id,
            is_avc,
            time_scale,
            nal_length_size,
            Arc::clone(&control),
            codec_data,
        );

        debug!(track_id, media = ?media, time_scale = %time_scale, "Created track");

        Ok(Self {
            track_id,
            source,
            media,
            time_scale,
            nal_length_size,
            control,
            ingest: Some(ingest),
            worker: None,
            started: false,
            events: None,
            progress_interval_us: 0,
        })
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.media, TrackMedia::Audio { .. })
    }

    pub fn time_scale(&self) -> TimeScale {
        self.time_scale
    }

    fn name(&self) -> &'static str {
        if self.is_audio() {
            "audio"
        } else {
            "video"
        }
    }

    /// Send worker progress to `events` every `interval_us` of media.
    pub(crate) fn set_events(&mut self, events: Option<Sender<TrackEvent>>, interval_us: i64) {
        self.events = events;
        self.progress_interval_us = interval_us;
    }

    /// Start pulling samples, or resume a paused track.
    pub(crate) fn start(&mut self, start_time_us: i64, barrier: &Arc<EosBarrier>) -> MuxResult<()> {
        if self.started {
            if self.control.is_paused() && !self.control.is_done() {
                self.control.resume();
                debug!(track_id = self.track_id, "Resuming {} track", self.name());
                return Ok(());
            }
            return Err(MuxError::NotReady(format!(
                "{} track already started",
                self.name()
            )));
        }

        let mut ingest = self.ingest.take().ok_or_else(|| {
            MuxError::NotReady(format!("{} track state is unavailable", self.name()))
        })?;
        ingest.events = self.events.clone();
        ingest.progress_interval_us = self.progress_interval_us;

        let mut signal = EosSignal {
            barrier: Arc::clone(barrier),
            ok: false,
        };

        info!(
            track_id = self.track_id,
            start_time_us,
            "Starting {} track",
            self.name()
        );
        if let Err(e) = self.source.start(&SourceStartParams { start_time_us }) {
            self.control.done.store(true, Ordering::Release);
            self.control.reached_eos.store(true, Ordering::Release);
            self.ingest = Some(ingest);
            return Err(e.into());
        }
        self.started = true;

        let source = Arc::clone(&self.source);
        let control = Arc::clone(&self.control);
        let name = self.name();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-track"))
            .spawn(move || {
                // Own the whole signal so the barrier is released by the worker.
                let mut signal = signal;
                let (ingest, result) = run_worker(ingest, source.as_ref(), &control);
                signal.ok = result.is_ok();
                (ingest, result)
            })
            .map_err(|e| MuxError::Worker(format!("Failed to spawn {name} track thread: {e}")))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Drop incoming samples until resumed by `start`.
    pub(crate) fn pause(&self) {
        self.control.pause();
    }

    /// Stop the source and join the worker.
    ///
    /// Returns the worker's error, if any; end of stream is success.
    pub(crate) fn stop(&mut self) -> MuxResult<()> {
        if !self.started {
            return Err(MuxError::NotReady(format!(
                "{} track stopped before it was started",
                self.name()
            )));
        }
        self.control.done.store(true, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        if let Err(e) = self.source.stop() {
            warn!(track_id = self.track_id, "Failed to stop {} source: {e}", self.name());
        }

        match handle.join() {
            Ok((ingest, result)) => {
                debug!(
                    track_id = self.track_id,
                    samples = ingest.samples.len(),
                    duration_us = ingest.duration_us,
                    empty = ingest.empty_samples,
                    "{} track stopped",
                    self.name()
                );
                self.ingest = Some(ingest);
                result
            }
            Err(_) => Err(MuxError::Worker(format!(
                "{} track worker panicked",
                self.name()
            ))),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub fn reached_eos(&self) -> bool {
        self.control.reached_eos.load(Ordering::Acquire)
    }

    fn state(&self) -> MuxResult<&SampleIngest> {
        self.ingest
            .as_ref()
            .ok_or_else(|| MuxError::NotReady(format!("{} track is still running", self.name())))
    }

    /// Producer timestamp of the segment's first sample.
    pub fn start_timestamp_us(&self) -> Option<i64> {
        self.ingest.as_ref().and_then(|s| s.start_timestamp_us)
    }

    /// Track duration in microseconds, paused intervals excluded.
    pub fn duration_us(&self) -> i64 {
        self.ingest.as_ref().map_or(0, |s| s.duration_us)
    }

    pub fn duration_ticks(&self) -> i64 {
        self.ingest.as_ref().map_or(0, |s| s.duration_ticks)
    }

    pub fn sample_count(&self) -> usize {
        self.ingest.as_ref().map_or(0, |s| s.samples.len())
    }

    /// Sample durations in ticks, in arrival order.
    pub fn sample_durations(&self) -> Vec<u32> {
        self.ingest
            .as_ref()
            .map(|s| s.samples.iter().map(|sample| sample.duration_ticks).collect())
            .unwrap_or_default()
    }

    pub fn codec_data(&self) -> Option<&CodecSpecificData> {
        self.ingest.as_ref().and_then(|s| s.codec_data.as_ref())
    }

    /// Write the `trak` box for the init header.
    pub(crate) fn write_trak(&self, writer: &mut BoxWriter, rotation: Rotation) -> MuxResult<()> {
        let state = self.state()?;
        let is_audio = self.is_audio();

        writer.begin_box(b"trak");
        match self.media {
            TrackMedia::Avc { width, height } => {
                mp4::write_tkhd(writer, self.track_id, false, rotation, width, height)?;
            }
            TrackMedia::Audio { .. } => {
                mp4::write_tkhd(writer, self.track_id, true, Rotation::Deg0, 0, 0)?;
            }
        }
        mp4::write_edts(writer)?;

        writer.begin_box(b"mdia");
        mp4::write_mdhd(writer, self.time_scale)?;
        mp4::write_hdlr(writer, is_audio)?;

        writer.begin_box(b"minf");
        mp4::write_media_header(writer, is_audio)?;
        mp4::write_dinf(writer)?;

        writer.begin_box(b"stbl");
        match (&self.media, &state.codec_data) {
            (TrackMedia::Avc { width, height }, Some(CodecSpecificData::Avc(config))) => {
                let record = config.to_record(self.nal_length_size);
                mp4::write_stsd_avc(writer, *width, *height, &record)?;
            }
            (TrackMedia::Avc { .. }, _) => {
                return Err(MuxError::Malformed(
                    "AVC track has no codec specific data".into(),
                ));
            }
            (
                TrackMedia::Audio {
                    codec,
                    sample_rate,
                    channels,
                },
                codec_data,
            ) => {
                let dsi = match codec_data {
                    Some(CodecSpecificData::Audio(dsi)) => Some(dsi.as_slice()),
                    _ => None,
                };
                mp4::write_stsd_audio(writer, *codec, *sample_rate, *channels, dsi)?;
            }
        }
        mp4::write_empty_sample_tables(writer)?;
        writer.end_box()?; // stbl
        writer.end_box()?; // minf
        writer.end_box()?; // mdia
        writer.end_box() // trak
    }

    /// Default sample duration advertised in `trex`.
    pub(crate) fn default_sample_duration(&self) -> u32 {
        self.ingest
            .as_ref()
            .and_then(|s| s.samples.first())
            .map_or(0, |sample| sample.duration_ticks)
    }

    /// Write this track's `traf`.
    ///
    /// The decode time is this track's start relative to
    /// `earliest_start_us`, the first sample time of the earliest track.
    /// Returns the `trun` data offset, resolved by `write_mdat_payload`.
    pub(crate) fn write_traf(
        &self,
        writer: &mut BoxWriter,
        offsets: &mut XmtaOffsets,
        earliest_start_us: i64,
    ) -> MuxResult<Stash> {
        let state = self.state()?;
        let is_audio = self.is_audio();

        let start_us = state.start_timestamp_us.unwrap_or(earliest_start_us);
        let decode_time = u32::try_from(self.time_scale.ticks(start_us - earliest_start_us))
            .map_err(|_| {
                MuxError::Malformed(format!(
                    "{} track starts before the earliest track",
                    self.name()
                ))
            })?;

        let entries = state
            .samples
            .iter()
            .map(|sample| Ok((sample.duration_ticks, trun_sample_size(sample.data.len())?)))
            .collect::<MuxResult<Vec<_>>>()?;

        writer.begin_box(b"traf");
        mp4::write_tfhd(writer, self.track_id, is_audio)?;
        mp4::write_tfdt(writer, offsets, is_audio, decode_time)?;
        let data_offset = mp4::write_trun(writer, is_audio, entries.into_iter())?;
        writer.end_box()?;
        Ok(data_offset)
    }

    /// Append this track's payload to the open `mdat`, resolving the
    /// `trun` data offset relative to the `moof` start.
    pub(crate) fn write_mdat_payload(
        &self,
        writer: &mut BoxWriter,
        data_offset: Stash,
        moof_offset: usize,
    ) -> MuxResult<()> {
        let state = self.state()?;
        let offset = u32::try_from(writer.position() - moof_offset)
            .map_err(|_| MuxError::Malformed("Fragment exceeds 32-bit offsets".into()))?;
        writer.resolve(data_offset, offset);
        for sample in &state.samples {
            std::io::Write::write_all(writer, &sample.data)?;
        }
        Ok(())
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!(track_id = self.track_id, "Track stopped on drop with error: {e}");
            }
        }
    }
}

/// Worker thread body: read until done, end of stream or error.
fn trun_sample_size(len: usize) -> MuxResult<u32> {
    u32::try_from(len)
        .map_err(|_| MuxError::Malformed(format!("Sample of {len} bytes overflows 32 bits")))
}

fn run_worker(
    mut ingest: SampleIngest,
    source: &dyn SampleSource,
    control: &TrackControl,
) -> WorkerResult {
    let result = loop {
        if control.is_done() {
            break Ok(());
        }
        match source.read() {
            Ok(sample) => {
                if let Err(e) = ingest.push(sample) {
                    break Err(e);
                }
            }
            Err(SourceError::EndOfStream | SourceError::Stopped) => break Ok(()),
            Err(e) => break Err(MuxError::from(e)),
        }
    };

    ingest.finish();
    if let Err(e) = &result {
        warn!(track_id = ingest.track_id, "{} track failed: {e}", ingest.name());
    }
    ingest.report_finished(&result);
    control.reached_eos.store(true, Ordering::Release);
    (ingest, result)
}
