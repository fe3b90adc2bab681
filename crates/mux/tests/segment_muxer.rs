//! End-to-end tests for `SegmentMuxer`: scripted sources in, a complete
//! fragmented-MP4 segment out, checked box by box.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use dash_common::{
    AudioCodec, MuxerConfig, Sample, SampleSource, SourceError, SourceFormat, SourceResult,
    SourceStartParams, VideoCodec,
};
use dash_mux::inspect::{self, BoxHeader};
use dash_mux::mp4::{PRESENTATION_MARKER, SEQUENCE_MARKER};
use dash_mux::{patch, AvcConfig, MuxError, SegmentIndex, SegmentMuxer, SegmentPatch, StartParams};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SPS: [u8; 7] = [0x67, 0x4D, 0x40, 0x1F, 0xEC, 0xA0, 0x50];
const PPS: [u8; 4] = [0x68, 0xEE, 0x3C, 0x80];
/// AAC-LC, 48 kHz, stereo.
const AUDIO_SPECIFIC_CONFIG: [u8; 2] = [0x11, 0x90];
const AAC_FRAME_US: f64 = 1024.0 * 1_000_000.0 / 48_000.0;

/// Replays a fixed list of results, then reports end of stream.
struct ScriptedSource {
    format: SourceFormat,
    script: Mutex<VecDeque<SourceResult<Sample>>>,
    started_at: Mutex<Option<i64>>,
}

impl ScriptedSource {
    fn new(format: SourceFormat, script: Vec<SourceResult<Sample>>) -> Arc<Self> {
        Arc::new(Self {
            format,
            script: Mutex::new(script.into()),
            started_at: Mutex::new(None),
        })
    }

    fn from_samples(format: SourceFormat, samples: Vec<Sample>) -> Arc<Self> {
        Self::new(format, samples.into_iter().map(Ok).collect())
    }
}

impl SampleSource for ScriptedSource {
    fn format(&self) -> SourceFormat {
        self.format.clone()
    }

    fn start(&self, params: &SourceStartParams) -> SourceResult<()> {
        *self.started_at.lock() = Some(params.start_time_us);
        Ok(())
    }

    fn stop(&self) -> SourceResult<()> {
        Ok(())
    }

    fn read(&self) -> SourceResult<Sample> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Err(SourceError::EndOfStream))
    }
}

/// Holds reads back until opened, and can refuse to start.
struct GatedSource {
    inner: Arc<ScriptedSource>,
    refuse_start: bool,
    open: Mutex<bool>,
    opened: Condvar,
    stopped: AtomicBool,
}

impl GatedSource {
    fn new(inner: Arc<ScriptedSource>, refuse_start: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            refuse_start,
            open: Mutex::new(false),
            opened: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl SampleSource for GatedSource {
    fn format(&self) -> SourceFormat {
        self.inner.format()
    }

    fn start(&self, params: &SourceStartParams) -> SourceResult<()> {
        if self.refuse_start {
            return Err(SourceError::Encoder("encoder busy".into()));
        }
        self.inner.start(params)
    }

    fn stop(&self) -> SourceResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.open();
        Ok(())
    }

    fn read(&self) -> SourceResult<Sample> {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SourceError::Stopped);
        }
        self.inner.read()
    }
}

fn annexb(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(unit);
    }
    out
}

/// Codec config followed by `count` frames at 30 fps, key frame first.
fn video_samples(count: i64) -> Vec<Sample> {
    let mut samples = vec![Sample::codec_config(annexb(&[&SPS, &PPS]), 0)];
    for i in 0..count {
        let nal_type = if i == 0 { 0x65 } else { 0x41 };
        let payload = annexb(&[&[nal_type, 0x88, i as u8, 0x10, 0x20]]);
        samples.push(Sample::new(payload, i * 33_333).with_sync(i == 0));
    }
    samples
}

fn audio_samples(start_us: i64, count: i64) -> Vec<Sample> {
    let mut samples = vec![Sample::codec_config(AUDIO_SPECIFIC_CONFIG.to_vec(), start_us)];
    for i in 0..count {
        let pts = start_us + (i as f64 * AAC_FRAME_US) as i64;
        samples.push(Sample::new(vec![0x21, 0x1B, i as u8], pts));
    }
    samples
}

fn video_source(count: i64) -> Arc<ScriptedSource> {
    ScriptedSource::from_samples(
        SourceFormat::video(VideoCodec::H264, 1280, 720),
        video_samples(count),
    )
}

fn offline_config() -> MuxerConfig {
    MuxerConfig {
        real_time: false,
        ..MuxerConfig::default()
    }
}

fn run_segment(muxer: &mut SegmentMuxer) -> Result<Vec<u8>, MuxError> {
    muxer.start(&StartParams::default())?;
    muxer.wait_for_eos();
    muxer.stop()?;
    Ok(muxer.take_output().expect("stop succeeded without output"))
}

fn find(buf: &[u8], path: &[&[u8; 4]]) -> BoxHeader {
    inspect::find(buf, path)
        .unwrap()
        .unwrap_or_else(|| panic!("missing box {path:?}"))
}

/// `traf` boxes of the segment's `moof`, in order.
fn trafs(buf: &[u8]) -> Vec<BoxHeader> {
    let moof = find(buf, &[b"moof"]);
    inspect::children(buf, &moof, 0)
        .map(Result::unwrap)
        .filter(|header| header.is(b"traf"))
        .collect()
}

fn child(buf: &[u8], parent: &BoxHeader, box_type: &[u8; 4]) -> BoxHeader {
    inspect::children(buf, parent, 0)
        .map(Result::unwrap)
        .find(|header| header.is(box_type))
        .unwrap_or_else(|| panic!("missing child {box_type:?}"))
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    inspect::read_u32(buf, offset).unwrap()
}

// ---------------------------------------------------------------------------
// Video only
// ---------------------------------------------------------------------------

#[test]
fn video_only_segment_has_one_run_of_all_samples() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video_source(10), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let types = inspect::top_level_types(&buf).unwrap();
    assert_eq!(
        types,
        vec![
            *b"ftyp", *b"free", *b"moov", *b"styp", *b"free", *b"sidx", *b"moof", *b"mdat"
        ]
    );

    let traf = trafs(&buf);
    assert_eq!(traf.len(), 1);
    let trun = child(&buf, &traf[0], b"trun");
    assert_eq!(u32_at(&buf, trun.body_offset() + 4), 10);

    // All durations are one frame at 90 kHz.
    let first_entry = trun.body_offset() + 4 + 4 + 4 + 4;
    for i in 0..10 {
        assert_eq!(u32_at(&buf, first_entry + i * 8), 3000);
        // 4-byte length prefix + 5-byte NAL.
        assert_eq!(u32_at(&buf, first_entry + i * 8 + 4), 9);
    }
    assert_eq!(muxer.key_track_duration_us(), 9 * 33_333 + 33_333);
}

#[test]
fn every_forward_reference_is_resolved() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video_source(10), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    assert!(!buf.windows(4).any(|w| w == b"????"));

    // Markers stay in place for the client.
    let index = SegmentIndex::locate(&buf).unwrap();
    assert_eq!(&buf[index.sequence_number.unwrap()..][..4], &SEQUENCE_MARKER);
    assert_eq!(&buf[index.presentation_time.unwrap()..][..4], &PRESENTATION_MARKER);
    assert!(index.video_decode_time.is_some());
    assert_eq!(index.audio_decode_time, None);
    assert!(!index.mute);
}

#[test]
fn sidx_covers_styp_to_end_of_segment() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video_source(10), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let styp = find(&buf, &[b"styp"]);
    let sidx = find(&buf, &[b"sidx"]);
    let mdat = find(&buf, &[b"mdat"]);
    assert_eq!(mdat.end(), buf.len());

    let body = sidx.body_offset();
    assert_eq!(u32_at(&buf, body + 8), 90_000); // timescale
    assert_eq!(u32_at(&buf, body + 24) as usize, buf.len() - styp.offset);
    assert_eq!(u32_at(&buf, body + 28), 30_000); // subsegment duration
}

#[test]
fn data_offset_points_at_first_sample() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video_source(3), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let moof = find(&buf, &[b"moof"]);
    let mdat = find(&buf, &[b"mdat"]);
    let trun = child(&buf, &trafs(&buf)[0], b"trun");
    let data_offset = u32_at(&buf, trun.body_offset() + 8) as usize;

    assert_eq!(moof.offset + data_offset, mdat.body_offset());
    let first = &buf[mdat.body_offset()..mdat.body_offset() + 9];
    assert_eq!(first, &[0, 0, 0, 5, 0x65, 0x88, 0x00, 0x10, 0x20]);
}

#[test]
fn avcc_recovers_profile_and_level() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video_source(2), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let stsd = find(&buf, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"]);
    let avc1 = inspect::children(&buf, &stsd, 8).next().unwrap().unwrap();
    assert!(avc1.is(b"avc1"));
    let avcc = inspect::children(&buf, &avc1, 78).next().unwrap().unwrap();
    assert!(avcc.is(b"avcC"));

    let config = AvcConfig::from_record(avcc.body(&buf)).unwrap();
    assert_eq!(
        (config.profile_idc, config.profile_compatibility, config.level_idc),
        (SPS[1], SPS[2], SPS[3])
    );
    assert_eq!(config.sps, vec![SPS.to_vec()]);
    assert_eq!(config.pps, vec![PPS.to_vec()]);
    // lengthSizeMinusOne for 4-byte prefixes.
    assert_eq!(avcc.body(&buf)[4] & 0x03, 3);
}

#[test]
fn header_can_be_omitted() {
    let config = MuxerConfig {
        write_init_header: false,
        ..offline_config()
    };
    let mut muxer = SegmentMuxer::new(config);
    muxer.init(video_source(4), None, false).unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let types = inspect::top_level_types(&buf).unwrap();
    assert_eq!(types[0], *b"styp");
    assert!(!types.contains(b"moov"));
}

#[test]
fn source_error_drops_segment() {
    let mut script: Vec<SourceResult<Sample>> = video_samples(3).into_iter().map(Ok).collect();
    script.push(Err(SourceError::Encoder("encoder reset".into())));
    let source = ScriptedSource::new(SourceFormat::video(VideoCodec::H264, 640, 360), script);

    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(source, None, false).unwrap();
    let err = run_segment(&mut muxer).unwrap_err();
    assert!(matches!(err, MuxError::Source(_)));
    assert!(err.is_recoverable());
    assert!(muxer.take_output().is_none());
}

#[test]
fn malformed_codec_config_drops_segment() {
    let bad_sps = [0x67, 0x42, 0x00, 0x1E, 0x99];
    let mut samples = vec![Sample::codec_config(annexb(&[&SPS, &bad_sps, &PPS]), 0)];
    samples.extend(video_samples(3).into_iter().skip(1));
    let source = ScriptedSource::from_samples(SourceFormat::video(VideoCodec::H264, 640, 360), samples);

    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(source, None, false).unwrap();
    let err = run_segment(&mut muxer).unwrap_err();
    assert!(matches!(err, MuxError::Malformed(_)));
}

#[test]
fn eos_waits_for_a_blocked_track() {
    let video = GatedSource::new(video_source(3), false);
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video.clone(), None, false).unwrap();
    muxer.start(&StartParams::default()).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(!muxer.reached_eos());

    video.open();
    muxer.wait_for_eos();
    muxer.stop().unwrap();
    assert_eq!(muxer.video_track().unwrap().sample_count(), 3);
    assert!(muxer.take_output().is_some());
}

// ---------------------------------------------------------------------------
// Video + audio
// ---------------------------------------------------------------------------

#[test]
fn failed_track_start_stops_started_tracks() {
    let video = GatedSource::new(video_source(3), false);
    let audio = GatedSource::new(audio_source(0, 4), true);
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer.init(video.clone(), Some(audio), false).unwrap();

    let err = muxer.start(&StartParams::default()).unwrap_err();
    assert!(matches!(err, MuxError::Source(_)));
    assert!(video.stopped.load(Ordering::SeqCst));
    assert!(matches!(muxer.stop(), Err(MuxError::NotReady(_))));
    assert!(muxer.take_output().is_none());
}

fn audio_source(start_us: i64, count: i64) -> Arc<ScriptedSource> {
    ScriptedSource::from_samples(
        SourceFormat::audio(AudioCodec::Aac, 48_000, 2),
        audio_samples(start_us, count),
    )
}

#[test]
fn audio_follows_video_in_moof_and_mdat() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer
        .init(video_source(10), Some(audio_source(0, 16)), true)
        .unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let traf = trafs(&buf);
    assert_eq!(traf.len(), 2);
    let tfhd_video = child(&buf, &traf[0], b"tfhd");
    let tfhd_audio = child(&buf, &traf[1], b"tfhd");
    assert_eq!(u32_at(&buf, tfhd_video.body_offset() + 4), 1);
    assert_eq!(u32_at(&buf, tfhd_audio.body_offset() + 4), 2);

    let moof = find(&buf, &[b"moof"]);
    let mdat = find(&buf, &[b"mdat"]);
    let video_trun = child(&buf, &traf[0], b"trun");
    let audio_trun = child(&buf, &traf[1], b"trun");
    assert_eq!(u32_at(&buf, audio_trun.body_offset() + 4), 16);

    let video_offset = u32_at(&buf, video_trun.body_offset() + 8) as usize;
    let audio_offset = u32_at(&buf, audio_trun.body_offset() + 8) as usize;
    assert_eq!(moof.offset + video_offset, mdat.body_offset());
    // 10 video samples of 9 bytes precede the audio payload.
    assert_eq!(audio_offset - video_offset, 90);
    assert_eq!(
        &buf[moof.offset + audio_offset..moof.offset + audio_offset + 3],
        &[0x21, 0x1B, 0x00]
    );
    assert_eq!(mdat.size, 8 + 90 + 16 * 3);

    let index = SegmentIndex::locate(&buf).unwrap();
    assert!(index.mute);
    assert!(index.audio_decode_time.is_some());

    let mvhd = find(&buf, &[b"moov", b"mvhd"]);
    // next_track_ID is the last field of mvhd.
    assert_eq!(u32_at(&buf, mvhd.end() - 4), 3);
}

#[test]
fn tfdt_carries_start_skew_between_tracks() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer
        .init(video_source(10), Some(audio_source(50_000, 12)), false)
        .unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let traf = trafs(&buf);
    let video_tfdt = child(&buf, &traf[0], b"tfdt");
    let audio_tfdt = child(&buf, &traf[1], b"tfdt");
    assert_eq!(u32_at(&buf, video_tfdt.body_offset() + 4), 0);
    // 50 ms at 48 kHz.
    assert_eq!(u32_at(&buf, audio_tfdt.body_offset() + 4), 2400);
}

#[test]
fn audio_trak_carries_esds() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer
        .init(video_source(2), Some(audio_source(0, 4)), false)
        .unwrap();
    let buf = run_segment(&mut muxer).unwrap();

    let moov = find(&buf, &[b"moov"]);
    let traks: Vec<BoxHeader> = inspect::children(&buf, &moov, 0)
        .map(Result::unwrap)
        .filter(|header| header.is(b"trak"))
        .collect();
    assert_eq!(traks.len(), 2);

    let mdia = child(&buf, &traks[1], b"mdia");
    let mdhd = child(&buf, &mdia, b"mdhd");
    assert_eq!(u32_at(&buf, mdhd.body_offset() + 12), 48_000);
    let minf = child(&buf, &mdia, b"minf");
    let stbl = child(&buf, &minf, b"stbl");
    let stsd = child(&buf, &stbl, b"stsd");
    let mp4a = inspect::children(&buf, &stsd, 8).next().unwrap().unwrap();
    assert!(mp4a.is(b"mp4a"));
    let esds = inspect::children(&buf, &mp4a, 28).next().unwrap().unwrap();
    assert!(esds.is(b"esds"));
    let dsi = dash_mux::esds::decoder_specific_info(esds.body(&buf)).unwrap();
    assert_eq!(dsi, AUDIO_SPECIFIC_CONFIG);
}

#[test]
fn real_time_start_applies_lead_in() {
    let video = video_source(2);
    let audio = audio_source(0, 4);
    let mut muxer = SegmentMuxer::new(MuxerConfig::default());
    muxer
        .init(video.clone(), Some(audio.clone()), false)
        .unwrap();
    let params = StartParams {
        start_time_us: 1_000_000,
        ..StartParams::default()
    };
    muxer.start(&params).unwrap();
    muxer.wait_for_eos();
    muxer.stop().unwrap();

    assert_eq!(*video.started_at.lock(), Some(1_700_000));
    assert_eq!(*audio.started_at.lock(), Some(1_900_000));
}

#[test]
fn client_patch_rebases_segment() {
    let mut muxer = SegmentMuxer::new(offline_config());
    muxer
        .init(video_source(4), Some(audio_source(0, 6)), false)
        .unwrap();
    let mut buf = run_segment(&mut muxer).unwrap();

    let values = SegmentPatch {
        sequence_number: 42,
        earliest_presentation_time: 180_000,
        video_decode_base: 180_000,
        audio_decode_base: 96_000,
    };
    let index = patch(&mut buf, &values).unwrap();
    assert_eq!(u32_at(&buf, index.sequence_number.unwrap()), 42);
    assert_eq!(u32_at(&buf, index.presentation_time.unwrap()), 180_000);
    assert_eq!(u32_at(&buf, index.video_decode_time.unwrap()), 180_000);
    assert_eq!(u32_at(&buf, index.audio_decode_time.unwrap()), 96_000);

    let mfhd = find(&buf, &[b"moof", b"mfhd"]);
    assert_eq!(u32_at(&buf, mfhd.body_offset() + 4), 42);
}
