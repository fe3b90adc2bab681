//! Low-level box writing primitives.
//!
//! Boxes are written into a growable in-memory buffer. Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "styp", "moof", "mdat")
//!
//! "Full boxes" additionally have a 1-byte version and 3-byte flags.
//!
//! Sizes and forward references are patched in place once known. All
//! recorded positions are indices into the buffer, so growing it never
//! invalidates them.

use byteorder::{BigEndian, WriteBytesExt};
use dash_common::Rotation;
use std::io::{self, Write};

use crate::error::{MuxError, MuxResult};

/// Bytes written in place of a forward reference until it is resolved.
pub const UNRESOLVED: [u8; 4] = *b"????";

/// A 4-byte forward reference awaiting its value.
///
/// Resolving consumes the handle, so a reference cannot be patched twice.
#[must_use = "a stash must be resolved before the buffer is finished"]
#[derive(Debug, PartialEq, Eq)]
pub struct Stash {
    offset: usize,
}

impl Stash {
    /// Buffer position of the placeholder.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Append-only box writer with in-place patching.
#[derive(Debug, Default)]
pub struct BoxWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
    unresolved: usize,
}

impl BoxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Current write position.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Number of boxes opened and not yet closed.
    pub fn open_boxes(&self) -> usize {
        self.open.len()
    }

    /// Number of stashes handed out and not yet resolved.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Open a box: size placeholder followed by the type.
    pub fn begin_box(&mut self, box_type: &[u8; 4]) {
        self.open.push(self.buf.len());
        self.buf.extend_from_slice(&[0; 4]);
        self.buf.extend_from_slice(box_type);
    }

    /// Open a full box (version + 24-bit flags follow the type).
    pub fn begin_full_box(&mut self, box_type: &[u8; 4], version: u8, flags: u32) -> MuxResult<()> {
        self.begin_box(box_type);
        let version_flags = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
        self.write_u32::<BigEndian>(version_flags)?;
        Ok(())
    }

    /// Close the innermost open box, patching its size.
    ///
    /// # Panics
    ///
    /// Panics if no box is open.
    pub fn end_box(&mut self) -> MuxResult<()> {
        let start = self
            .open
            .pop()
            .unwrap_or_else(|| panic!("end_box called with no open box"));
        let size = self.buf.len() - start;
        let size = u32::try_from(size)
            .map_err(|_| MuxError::Malformed(format!("Box size {size} exceeds 32-bit limit")))?;
        self.write_at(start, &size.to_be_bytes());
        Ok(())
    }

    /// Overwrite already-written bytes.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the current write position.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        assert!(
            end <= self.buf.len(),
            "write_at {offset}..{end} past end of buffer ({})",
            self.buf.len()
        );
        self.buf[offset..end].copy_from_slice(bytes);
    }

    /// Reserve a 4-byte forward reference at the current position.
    pub fn stash(&mut self) -> Stash {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&UNRESOLVED);
        self.unresolved += 1;
        Stash { offset }
    }

    /// Patch a forward reference with its big-endian value.
    pub fn resolve(&mut self, stash: Stash, value: u32) {
        self.write_at(stash.offset, &value.to_be_bytes());
        self.unresolved -= 1;
    }

    /// Take the finished buffer.
    ///
    /// # Panics
    ///
    /// Panics if a box is still open or a stash was never resolved.
    pub fn finish(self) -> Vec<u8> {
        assert!(self.open.is_empty(), "{} box(es) left open", self.open.len());
        assert_eq!(self.unresolved, 0, "unresolved forward references");
        self.buf
    }
}

impl Write for BoxWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write zero padding bytes.
pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> MuxResult<()> {
    let zeros = vec![0u8; count];
    writer.write_all(&zeros)?;
    Ok(())
}

/// Write a NUL-terminated string.
pub fn write_cstring<W: Write>(writer: &mut W, s: &str) -> MuxResult<()> {
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)?;
    Ok(())
}

/// ISO 639-2/T language code packed into 3x5 bits.
/// Default is "und" (undetermined).
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_lowercase) {
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

const FIXED_ONE: u32 = 0x0001_0000;
const FIXED_MINUS_ONE: u32 = 0xFFFF_0000;

/// Write the 3x3 display matrix for a rotation.
///
/// ```text
/// | a  b  u |
/// | c  d  v |
/// | x  y  w |
/// ```
/// `a b c d x y` are 16.16 fixed point, `u v w` are 2.30.
pub fn write_composition_matrix<W: Write>(writer: &mut W, rotation: Rotation) -> MuxResult<()> {
    let (a, b, c, d) = match rotation {
        Rotation::Deg0 => (FIXED_ONE, 0, 0, FIXED_ONE),
        Rotation::Deg90 => (0, FIXED_ONE, FIXED_MINUS_ONE, 0),
        Rotation::Deg180 => (FIXED_MINUS_ONE, 0, 0, FIXED_MINUS_ONE),
        Rotation::Deg270 => (0, FIXED_MINUS_ONE, FIXED_ONE, 0),
    };
    for value in [a, b, 0, c, d, 0, 0, 0, 0x4000_0000] {
        writer.write_u32::<BigEndian>(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_box() {
        let mut w = BoxWriter::new();
        w.begin_box(b"free");
        w.write_all(&[0xAA; 20]).unwrap();
        w.end_box().unwrap();
        let buf = w.finish();
        assert_eq!(buf.len(), 28);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 28]);
        assert_eq!(&buf[4..8], b"free");
    }

    #[test]
    fn test_nested_boxes() {
        let mut w = BoxWriter::new();
        w.begin_box(b"moof");
        w.begin_full_box(b"mfhd", 0, 0).unwrap();
        w.write_u32::<BigEndian>(7).unwrap();
        w.end_box().unwrap();
        assert_eq!(w.open_boxes(), 1);
        w.end_box().unwrap();
        let buf = w.finish();
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..8], &[0, 0, 0, 24, b'm', b'o', b'o', b'f']);
        assert_eq!(&buf[8..16], &[0, 0, 0, 16, b'm', b'f', b'h', b'd']);
        assert_eq!(&buf[16..24], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_full_box_header_with_flags() {
        let mut w = BoxWriter::new();
        w.begin_full_box(b"tkhd", 1, 0x000003).unwrap();
        w.end_box().unwrap();
        let buf = w.finish();
        assert_eq!(&buf[8..12], &[0x01, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_stash_and_resolve() {
        let mut w = BoxWriter::new();
        w.begin_box(b"sidx");
        let stash = w.stash();
        assert_eq!(stash.offset(), 8);
        assert_eq!(w.unresolved(), 1);
        assert_eq!(&w.as_bytes()[8..12], &UNRESOLVED);
        w.write_all(&[0; 100]).unwrap();
        w.resolve(stash, 0xDEAD_BEEF);
        w.end_box().unwrap();
        let buf = w.finish();
        assert_eq!(&buf[8..12], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_offsets_survive_growth() {
        let mut w = BoxWriter::with_capacity(4);
        let stash = w.stash();
        w.write_all(&vec![0x55; 1 << 16]).unwrap();
        w.resolve(stash, 42);
        assert_eq!(&w.finish()[0..4], &[0, 0, 0, 42]);
    }

    #[test]
    #[should_panic(expected = "no open box")]
    fn test_unbalanced_end_box_panics() {
        let mut w = BoxWriter::new();
        let _ = w.end_box();
    }

    #[test]
    #[should_panic(expected = "left open")]
    fn test_finish_with_open_box_panics() {
        let mut w = BoxWriter::new();
        w.begin_box(b"moov");
        let _ = w.finish();
    }

    #[test]
    #[should_panic(expected = "unresolved")]
    fn test_finish_with_unresolved_stash_panics() {
        let mut w = BoxWriter::new();
        let _stash = w.stash();
        let _ = w.finish();
    }

    #[test]
    #[should_panic(expected = "past end")]
    fn test_write_at_past_end_panics() {
        let mut w = BoxWriter::new();
        w.write_all(&[0; 2]).unwrap();
        w.write_at(0, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_language_und() {
        // u=0x15, n=0x0E, d=0x04
        assert_eq!(encode_language("und"), 0x55C4);
        assert_eq!(encode_language(""), 0x55C4);
        assert_eq!(encode_language("EN!"), 0x55C4);
    }

    #[test]
    fn test_encode_language_eng() {
        // (5 << 10) | (14 << 5) | 7
        assert_eq!(encode_language("eng"), 5575);
    }

    #[test]
    fn test_write_zeros_and_cstring() {
        let mut buf = Vec::new();
        write_zeros(&mut buf, 3).unwrap();
        write_cstring(&mut buf, "ab").unwrap();
        assert_eq!(buf, vec![0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn test_composition_matrix_identity() {
        let mut buf = Vec::new();
        write_composition_matrix(&mut buf, Rotation::Deg0).unwrap();
        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&buf[16..20], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&buf[32..36], &[0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_composition_matrix_90() {
        let mut buf = Vec::new();
        write_composition_matrix(&mut buf, Rotation::Deg90).unwrap();
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&buf[12..16], &[0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(&buf[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_composition_matrix_270() {
        let mut buf = Vec::new();
        write_composition_matrix(&mut buf, Rotation::Deg270).unwrap();
        assert_eq!(&buf[4..8], &[0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(&buf[12..16], &[0x00, 0x01, 0x00, 0x00]);
    }
}
