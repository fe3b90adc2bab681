//! Box writers for fragmented ISO-BMFF segments.
//!
//! Header boxes (written once per stream, or per segment):
//! ftyp, free, moov (mvhd, mvex/mehd/trex/trep, trak/tkhd/edts/mdia/...)
//!
//! Segment boxes:
//! styp, free/Xmta, sidx, moof (mfhd, traf/tfhd/tfdt/trun), mdat
//!
//! Per-track composition lives in the track module; these functions only
//! know about box layouts.

use byteorder::{BigEndian, WriteBytesExt};
use dash_common::{AudioCodec, Rotation, TimeScale};
use std::io::Write;

use crate::atoms::{
    encode_language, write_composition_matrix, write_cstring, write_zeros, BoxWriter, Stash,
};
use crate::error::{MuxError, MuxResult};
use crate::esds::write_esds;

/// Written in `mfhd` in place of the sequence number; clients patch it.
pub const SEQUENCE_MARKER: [u8; 4] = *b"?seq";
/// Written in `sidx` in place of the earliest presentation time; clients patch it.
pub const PRESENTATION_MARKER: [u8; 4] = *b"?prs";

/// tfhd: default-sample-flags-present | default-base-is-moof.
const TFHD_FLAGS: u32 = 0x0000_0020 | 0x0002_0000;
/// trun: data-offset | sample-duration | sample-size.
const TRUN_FLAGS: u32 = 0x0000_0001 | 0x0000_0100 | 0x0000_0200;
const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0004;
/// "sample depends on no other".
const SAMPLE_DEPENDS_NO: u32 = 0x0200_0000;
/// "sample depends on others" | "non-sync".
const SAMPLE_DEPENDS_YES_NON_SYNC: u32 = 0x0100_0000 | 0x0001_0000;

// ---------------------------------------------------------------------------
// Stream header
// ---------------------------------------------------------------------------

/// Write the ftyp (File Type) box.
///
/// Major brand iso5, compatible brands: avc1, iso5, dash
pub fn write_ftyp(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"ftyp");
    writer.write_all(b"iso5")?; // major brand
    writer.write_u32::<BigEndian>(1)?; // minor version
    writer.write_all(b"avc1")?;
    writer.write_all(b"iso5")?;
    writer.write_all(b"dash")?;
    writer.end_box()
}

/// Write an empty free box.
pub fn write_free(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"free");
    writer.end_box()
}

/// Write the mvhd (Movie Header) box, version 0.
///
/// Fragments carry all timing, so duration is left at 0.
pub fn write_mvhd(writer: &mut BoxWriter, num_tracks: u32) -> MuxResult<()> {
    writer.begin_full_box(b"mvhd", 0, 0)?;
    writer.write_u32::<BigEndian>(0)?; // creation_time
    writer.write_u32::<BigEndian>(0)?; // modification_time
    writer.write_u32::<BigEndian>(TimeScale::MOVIE.as_u32())?;
    writer.write_u32::<BigEndian>(0)?; // duration
    writer.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    writer.write_u16::<BigEndian>(0x0100)?; // volume 1.0
    write_zeros(writer, 10)?; // reserved
    write_composition_matrix(writer, Rotation::Deg0)?;
    write_zeros(writer, 24)?; // pre_defined
    writer.write_u32::<BigEndian>(num_tracks + 1)?; // next_track_ID
    writer.end_box()
}

/// Write the mehd (Movie Extends Header) box with the fragment duration in ms.
pub fn write_mehd(writer: &mut BoxWriter, fragment_duration_ms: u32) -> MuxResult<()> {
    writer.begin_full_box(b"mehd", 0, 0)?;
    writer.write_u32::<BigEndian>(fragment_duration_ms)?;
    writer.end_box()
}

/// Write the trex (Track Extends) box.
pub fn write_trex(
    writer: &mut BoxWriter,
    track_id: u32,
    default_duration: u32,
    is_audio: bool,
) -> MuxResult<()> {
    writer.begin_full_box(b"trex", 0, 0)?;
    writer.write_u32::<BigEndian>(track_id)?;
    writer.write_u32::<BigEndian>(1)?; // default_sample_description_index
    writer.write_u32::<BigEndian>(default_duration)?;
    writer.write_u32::<BigEndian>(0)?; // default_sample_size (variable)
    writer.write_u32::<BigEndian>(if is_audio { 0 } else { 0x0001_0000 })?;
    writer.end_box()
}

/// Write the trep (Track Extension Properties) box.
pub fn write_trep(writer: &mut BoxWriter, track_id: u32) -> MuxResult<()> {
    writer.begin_full_box(b"trep", 0, 0)?;
    writer.write_u32::<BigEndian>(track_id)?;
    writer.end_box()
}

/// Write the tkhd (Track Header) box, version 0, enabled + in movie.
pub fn write_tkhd(
    writer: &mut BoxWriter,
    track_id: u32,
    is_audio: bool,
    rotation: Rotation,
    width: u32,
    height: u32,
) -> MuxResult<()> {
    writer.begin_full_box(b"tkhd", 0, 0x000003)?;
    writer.write_u32::<BigEndian>(0)?; // creation_time
    writer.write_u32::<BigEndian>(0)?; // modification_time
    writer.write_u32::<BigEndian>(track_id)?;
    writer.write_u32::<BigEndian>(0)?; // reserved
    writer.write_u32::<BigEndian>(0)?; // duration
    write_zeros(writer, 8)?; // reserved
    writer.write_u16::<BigEndian>(0)?; // layer
    writer.write_u16::<BigEndian>(0)?; // alternate_group
    writer.write_u16::<BigEndian>(if is_audio { 0x0100 } else { 0 })?; // volume
    writer.write_u16::<BigEndian>(0)?; // reserved
    write_composition_matrix(writer, rotation)?;
    // Width/height as 16.16 fixed point; the shift drops bits above 16.
    writer.write_u32::<BigEndian>(width << 16)?;
    writer.write_u32::<BigEndian>(height << 16)?;
    writer.end_box()
}

/// Write edts with a single empty edit.
pub fn write_edts(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"edts");
    writer.begin_full_box(b"elst", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count
    writer.write_u32::<BigEndian>(0)?; // segment_duration
    writer.write_u32::<BigEndian>(0)?; // media_time
    writer.write_u16::<BigEndian>(1)?; // media_rate_integer
    writer.write_u16::<BigEndian>(0)?; // media_rate_fraction
    writer.end_box()?;
    writer.end_box()
}

/// Write the mdhd (Media Header) box, version 0.
pub fn write_mdhd(writer: &mut BoxWriter, time_scale: TimeScale) -> MuxResult<()> {
    writer.begin_full_box(b"mdhd", 0, 0)?;
    writer.write_u32::<BigEndian>(0)?; // creation_time
    writer.write_u32::<BigEndian>(0)?; // modification_time
    writer.write_u32::<BigEndian>(time_scale.as_u32())?;
    writer.write_u32::<BigEndian>(0)?; // duration
    writer.write_u16::<BigEndian>(encode_language("und"))?;
    writer.write_u16::<BigEndian>(0)?; // pre_defined
    writer.end_box()
}

/// Write the hdlr (Handler Reference) box.
pub fn write_hdlr(writer: &mut BoxWriter, is_audio: bool) -> MuxResult<()> {
    writer.begin_full_box(b"hdlr", 0, 0)?;
    writer.write_u32::<BigEndian>(0)?; // pre_defined
    writer.write_all(if is_audio { b"soun" } else { b"vide" })?;
    write_zeros(writer, 12)?; // reserved
    write_cstring(writer, if is_audio { "SoundHandler" } else { "VideoHandler" })?;
    writer.end_box()
}

/// Write vmhd (video) or smhd (audio).
pub fn write_media_header(writer: &mut BoxWriter, is_audio: bool) -> MuxResult<()> {
    if is_audio {
        writer.begin_full_box(b"smhd", 0, 0)?;
        writer.write_i16::<BigEndian>(0)?; // balance
        writer.write_u16::<BigEndian>(0)?; // reserved
    } else {
        writer.begin_full_box(b"vmhd", 0, 0x000001)?;
        writer.write_u16::<BigEndian>(0)?; // graphicsmode
        write_zeros(writer, 6)?; // opcolor
    }
    writer.end_box()
}

/// Write the dinf box with a single self-contained url entry.
pub fn write_dinf(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"dinf");
    writer.begin_full_box(b"dref", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count
    writer.begin_full_box(b"url ", 0, 0x000001)?; // flag 1 = self-contained
    writer.end_box()?;
    writer.end_box()?;
    writer.end_box()
}

fn write_zero_entry_box(writer: &mut BoxWriter, box_type: &[u8; 4], extra_zeros: usize) -> MuxResult<()> {
    writer.begin_full_box(box_type, 0, 0)?;
    writer.write_u32::<BigEndian>(0)?; // entry_count
    write_zeros(writer, extra_zeros * 4)?;
    writer.end_box()
}

/// Empty stts/stsc/stsz/stco: samples live in fragments.
pub fn write_empty_sample_tables(writer: &mut BoxWriter) -> MuxResult<()> {
    write_zero_entry_box(writer, b"stts", 0)?;
    write_zero_entry_box(writer, b"stsc", 0)?;
    write_zero_entry_box(writer, b"stsz", 1)?;
    write_zero_entry_box(writer, b"stco", 0)
}

/// Write stsd with an avc1 sample entry.
///
/// `avcc` is a complete `AVCDecoderConfigurationRecord`.
pub fn write_stsd_avc(writer: &mut BoxWriter, width: u32, height: u32, avcc: &[u8]) -> MuxResult<()> {
    writer.begin_full_box(b"stsd", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count

    writer.begin_box(b"avc1");
    write_zeros(writer, 6)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(writer, 2)?; // pre_defined
    write_zeros(writer, 2)?; // reserved
    write_zeros(writer, 12)?; // pre_defined (3 x u32)
    writer.write_u16::<BigEndian>(width as u16)?;
    writer.write_u16::<BigEndian>(height as u16)?;
    writer.write_u32::<BigEndian>(0x0048_0000)?; // horizresolution (72 dpi)
    writer.write_u32::<BigEndian>(0x0048_0000)?; // vertresolution (72 dpi)
    write_zeros(writer, 4)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // frame_count
    writer.write_u8(0)?; // compressorname length
    writer.write_all(&[b' '; 31])?;
    writer.write_u16::<BigEndian>(0x0018)?; // depth
    writer.write_i16::<BigEndian>(-1)?; // pre_defined

    writer.begin_box(b"avcC");
    writer.write_all(avcc)?;
    writer.end_box()?;

    writer.end_box()?; // avc1
    writer.end_box()
}

/// Write stsd with an AAC (mp4a + esds) or AMR (samr/sawb + damr) entry.
pub fn write_stsd_audio(
    writer: &mut BoxWriter,
    codec: AudioCodec,
    sample_rate: u32,
    channels: u16,
    dsi: Option<&[u8]>,
) -> MuxResult<()> {
    let fourcc = codec.sample_entry().ok_or_else(|| {
        MuxError::Unsupported(format!("No sample entry for {}", codec.display_name()))
    })?;

    writer.begin_full_box(b"stsd", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // entry_count

    writer.begin_box(fourcc);
    write_zeros(writer, 6)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(writer, 8)?; // reserved (2 x u32)
    writer.write_u16::<BigEndian>(channels)?;
    writer.write_u16::<BigEndian>(16)?; // samplesize
    write_zeros(writer, 2)?; // pre_defined
    write_zeros(writer, 2)?; // reserved
    writer.write_u32::<BigEndian>(sample_rate << 16)?;

    match codec {
        AudioCodec::Aac => {
            let dsi = dsi.ok_or_else(|| {
                MuxError::Malformed("AAC track has no codec specific data".into())
            })?;
            write_esds(writer, dsi)?;
        }
        AudioCodec::AmrNb | AudioCodec::AmrWb => write_damr(writer)?,
        AudioCodec::Opus => {
            return Err(MuxError::Unsupported("Opus has no sample entry".into()));
        }
    }

    writer.end_box()?; // sample entry
    writer.end_box()
}

/// Write the damr (AMR decoder config) box.
fn write_damr(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"damr");
    write_cstring(writer, "   ")?; // vendor
    writer.write_u8(0)?; // decoder_version
    writer.write_u16::<BigEndian>(0x83FF)?; // mode_set: all
    writer.write_u8(0)?; // mode_change_period
    writer.write_u8(1)?; // frames_per_sample
    writer.end_box()
}

// ---------------------------------------------------------------------------
// Segment boxes
// ---------------------------------------------------------------------------

/// Write the styp (Segment Type) box.
pub fn write_styp(writer: &mut BoxWriter) -> MuxResult<()> {
    writer.begin_box(b"styp");
    writer.write_all(b"msdh")?; // major brand
    writer.write_u32::<BigEndian>(0)?; // minor version
    writer.write_all(b"msdh")?;
    writer.write_all(b"msix")?;
    writer.end_box()
}

/// Fields listed in the `Xmta` record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XmtaSlot {
    /// `mfhd` sequence number.
    SequenceNumber,
    /// `sidx` earliest presentation time.
    PresentationTime,
    /// Video `tfdt` base media decode time.
    VideoDecodeTime,
    /// Audio `tfdt` base media decode time.
    AudioDecodeTime,
}

/// Pending entries of the `Xmta` record.
///
/// Each entry is the buffer offset of a field a client rewrites at
/// playback time. Entries are pointed at fields as those are written;
/// `finish` zeroes the entries whose field never appeared.
#[derive(Debug)]
pub struct XmtaOffsets {
    slots: [Option<Stash>; 4],
}

impl XmtaOffsets {
    fn index(slot: XmtaSlot) -> usize {
        match slot {
            XmtaSlot::SequenceNumber => 0,
            XmtaSlot::PresentationTime => 1,
            XmtaSlot::VideoDecodeTime => 2,
            XmtaSlot::AudioDecodeTime => 3,
        }
    }

    /// Record the current write position as `slot`'s field.
    pub fn point_here(&mut self, writer: &mut BoxWriter, slot: XmtaSlot) -> MuxResult<()> {
        let stash = self.slots[Self::index(slot)]
            .take()
            .unwrap_or_else(|| panic!("Xmta slot {slot:?} recorded twice"));
        let offset = u32::try_from(writer.position())
            .map_err(|_| MuxError::Malformed("Segment exceeds 32-bit offsets".into()))?;
        writer.resolve(stash, offset);
        Ok(())
    }

    /// Resolve entries that were never pointed at a field to 0.
    pub fn finish(self, writer: &mut BoxWriter) {
        for stash in self.slots.into_iter().flatten() {
            writer.resolve(stash, 0);
        }
    }
}

/// Write a free box holding the `Xmta` record.
///
/// Players that do not know `Xmta` skip it as free space.
pub fn write_xmta(writer: &mut BoxWriter, mute: bool) -> MuxResult<XmtaOffsets> {
    writer.begin_box(b"free");
    writer.begin_full_box(b"Xmta", 0, 0)?;
    let slots = [writer.stash(), writer.stash(), writer.stash(), writer.stash()].map(Some);
    writer.write_u32::<BigEndian>(u32::from(mute))?;
    writer.end_box()?;
    writer.end_box()?;
    Ok(XmtaOffsets { slots })
}

/// Write the sidx (Segment Index) box, version 0, one reference.
///
/// Returns the referenced-size field, resolved once the segment is complete.
pub fn write_sidx(
    writer: &mut BoxWriter,
    offsets: &mut XmtaOffsets,
    time_scale: TimeScale,
    duration_ticks: u32,
) -> MuxResult<Stash> {
    writer.begin_full_box(b"sidx", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?; // reference_ID
    writer.write_u32::<BigEndian>(time_scale.as_u32())?;
    offsets.point_here(writer, XmtaSlot::PresentationTime)?;
    writer.write_all(&PRESENTATION_MARKER)?; // earliest_presentation_time
    writer.write_u32::<BigEndian>(0)?; // first_offset
    writer.write_u16::<BigEndian>(0)?; // reserved
    writer.write_u16::<BigEndian>(1)?; // reference_count
    let referenced_size = writer.stash(); // reference_type 0 + referenced_size
    writer.write_u32::<BigEndian>(duration_ticks)?; // subsegment_duration
    writer.write_u32::<BigEndian>(0)?; // SAP
    writer.end_box()?;
    Ok(referenced_size)
}

/// Write the mfhd (Movie Fragment Header) box.
pub fn write_mfhd(writer: &mut BoxWriter, offsets: &mut XmtaOffsets) -> MuxResult<()> {
    writer.begin_full_box(b"mfhd", 0, 0)?;
    offsets.point_here(writer, XmtaSlot::SequenceNumber)?;
    writer.write_all(&SEQUENCE_MARKER)?;
    writer.end_box()
}

/// Write the tfhd (Track Fragment Header) box.
pub fn write_tfhd(writer: &mut BoxWriter, track_id: u32, is_audio: bool) -> MuxResult<()> {
    writer.begin_full_box(b"tfhd", 0, TFHD_FLAGS)?;
    writer.write_u32::<BigEndian>(track_id)?;
    writer.write_u32::<BigEndian>(if is_audio {
        SAMPLE_DEPENDS_NO
    } else {
        SAMPLE_DEPENDS_YES_NON_SYNC
    })?;
    writer.end_box()
}

/// Write the tfdt (Track Fragment Decode Time) box, version 0.
///
/// The value is relative to the earliest track of the segment.
pub fn write_tfdt(
    writer: &mut BoxWriter,
    offsets: &mut XmtaOffsets,
    is_audio: bool,
    decode_time: u32,
) -> MuxResult<()> {
    writer.begin_full_box(b"tfdt", 0, 0)?;
    let slot = if is_audio {
        XmtaSlot::AudioDecodeTime
    } else {
        XmtaSlot::VideoDecodeTime
    };
    offsets.point_here(writer, slot)?;
    writer.write_u32::<BigEndian>(decode_time)?;
    writer.end_box()
}

/// Write the trun (Track Run) box from `(duration, size)` pairs.
///
/// Returns the data-offset field, resolved when the track's payload is
/// placed in mdat. Video runs flag their first sample as a sync sample.
pub fn write_trun<I>(writer: &mut BoxWriter, is_audio: bool, samples: I) -> MuxResult<Stash>
where
    I: ExactSizeIterator<Item = (u32, u32)>,
{
    let flags = if is_audio {
        TRUN_FLAGS
    } else {
        TRUN_FLAGS | TRUN_FIRST_SAMPLE_FLAGS_PRESENT
    };
    writer.begin_full_box(b"trun", 0, flags)?;
    writer.write_u32::<BigEndian>(samples.len() as u32)?;
    let data_offset = writer.stash();
    if !is_audio {
        writer.write_u32::<BigEndian>(SAMPLE_DEPENDS_NO)?; // first_sample_flags
    }
    for (duration, size) in samples {
        writer.write_u32::<BigEndian>(duration)?;
        writer.write_u32::<BigEndian>(size)?;
    }
    writer.end_box()?;
    Ok(data_offset)
}
