//! Client-side patching of a segment's `Xmta` record.
//!
//! A segment leaves its sequence number and earliest presentation time as
//! markers and its decode times relative to the segment. A client that
//! stitches segments into one timeline locates the fields through the
//! `Xmta` record and rewrites them in place.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{MuxError, MuxResult};
use crate::inspect::{self, BoxHeader};

/// Field positions read from a segment's `Xmta` record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentIndex {
    pub sequence_number: Option<usize>,
    pub presentation_time: Option<usize>,
    pub video_decode_time: Option<usize>,
    pub audio_decode_time: Option<usize>,
    pub mute: bool,
}

/// Values written by `patch`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentPatch {
    pub sequence_number: u32,
    pub earliest_presentation_time: u32,
    /// Added to the video `tfdt`.
    pub video_decode_base: u32,
    /// Added to the audio `tfdt`.
    pub audio_decode_base: u32,
}

impl SegmentIndex {
    /// Read the `Xmta` record of `segment`.
    ///
    /// `segment` may start with an init header; offsets are relative to
    /// the start of the buffer either way.
    pub fn locate(segment: &[u8]) -> MuxResult<Self> {
        for header in inspect::boxes(segment) {
            let header = header?;
            if !header.is(b"free") {
                continue;
            }
            let Some(child) = inspect::children(segment, &header, 0).next() else {
                continue;
            };
            let child = child?;
            if child.is(b"Xmta") {
                return Self::parse(segment, &child);
            }
        }
        Err(MuxError::Malformed("Segment has no Xmta record".into()))
    }

    fn parse(segment: &[u8], xmta: &BoxHeader) -> MuxResult<Self> {
        // version/flags, four offsets, mute flag
        if xmta.size < BoxHeader::LEN + 4 + 5 * 4 {
            return Err(MuxError::Malformed(format!(
                "Xmta record of {} bytes is too short",
                xmta.size
            )));
        }
        let base = xmta.body_offset() + 4;
        let field = |index: usize| -> MuxResult<Option<usize>> {
            let offset = inspect::read_u32(segment, base + index * 4)? as usize;
            if offset == 0 {
                return Ok(None);
            }
            if offset + 4 > segment.len() {
                return Err(MuxError::Malformed(format!(
                    "Xmta offset {offset} is outside the segment"
                )));
            }
            Ok(Some(offset))
        };
        Ok(Self {
            sequence_number: field(0)?,
            presentation_time: field(1)?,
            video_decode_time: field(2)?,
            audio_decode_time: field(3)?,
            mute: inspect::read_u32(segment, base + 16)? != 0,
        })
    }
}

/// Rewrite the fields indexed by `segment`'s `Xmta` record.
pub fn patch(segment: &mut [u8], values: &SegmentPatch) -> MuxResult<SegmentIndex> {
    let index = SegmentIndex::locate(segment)?;

    if let Some(offset) = index.sequence_number {
        BigEndian::write_u32(&mut segment[offset..], values.sequence_number);
    }
    if let Some(offset) = index.presentation_time {
        BigEndian::write_u32(&mut segment[offset..], values.earliest_presentation_time);
    }
    for (offset, base) in [
        (index.video_decode_time, values.video_decode_base),
        (index.audio_decode_time, values.audio_decode_base),
    ] {
        let Some(offset) = offset else {
            continue;
        };
        let value = BigEndian::read_u32(&segment[offset..])
            .checked_add(base)
            .ok_or_else(|| MuxError::Malformed("Decode time overflows 32 bits".into()))?;
        BigEndian::write_u32(&mut segment[offset..], value);
    }
    Ok(index)
}
