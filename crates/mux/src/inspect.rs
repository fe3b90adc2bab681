//! Read-only walking of box trees in a finished buffer.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{MuxError, MuxResult};

/// Location of one box within a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// Offset of the size field.
    pub offset: usize,
    /// Total size including the 8-byte header.
    pub size: usize,
}

impl BoxHeader {
    pub const LEN: usize = 8;

    /// Offset of the first byte after the header.
    pub fn body_offset(&self) -> usize {
        self.offset + Self::LEN
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn body<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.body_offset()..self.end()]
    }

    pub fn is(&self, box_type: &[u8; 4]) -> bool {
        &self.box_type == box_type
    }
}

/// Iterator over sibling boxes in `buf[start..end]`.
pub struct Boxes<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Boxes<'a> {
    fn new(buf: &'a [u8], start: usize, end: usize) -> Self {
        Self { buf, pos: start, end }
    }
}

impl Iterator for Boxes<'_> {
    type Item = MuxResult<BoxHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        if self.end - self.pos < BoxHeader::LEN {
            self.pos = self.end;
            return Some(Err(MuxError::Malformed("Truncated box header".into())));
        }
        let size = BigEndian::read_u32(&self.buf[self.pos..]) as usize;
        if size < BoxHeader::LEN || size > self.end - self.pos {
            let offset = self.pos;
            self.pos = self.end;
            return Some(Err(MuxError::Malformed(format!(
                "Box at {offset} has invalid size {size}"
            ))));
        }
        let mut box_type = [0u8; 4];
        box_type.copy_from_slice(&self.buf[self.pos + 4..self.pos + 8]);
        let header = BoxHeader {
            box_type,
            offset: self.pos,
            size,
        };
        self.pos += size;
        Some(Ok(header))
    }
}

/// Top-level boxes of `buf`.
pub fn boxes(buf: &[u8]) -> Boxes<'_> {
    Boxes::new(buf, 0, buf.len())
}

/// Children of `parent`, starting `skip` bytes into its body.
///
/// `skip` covers fields that precede the children, e.g. 4 for the
/// version/flags of a full box.
pub fn children<'a>(buf: &'a [u8], parent: &BoxHeader, skip: usize) -> Boxes<'a> {
    let start = (parent.body_offset() + skip).min(parent.end());
    Boxes::new(buf, start, parent.end())
}

/// Find the first box matching `path`, descending through plain containers.
pub fn find(buf: &[u8], path: &[&[u8; 4]]) -> MuxResult<Option<BoxHeader>> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(None);
    };
    let mut current = None;
    for header in boxes(buf) {
        let header = header?;
        if header.is(first) {
            current = Some(header);
            break;
        }
    }
    for box_type in rest {
        let Some(parent) = current else {
            return Ok(None);
        };
        current = None;
        for header in children(buf, &parent, 0) {
            let header = header?;
            if header.is(box_type) {
                current = Some(header);
                break;
            }
        }
    }
    Ok(current)
}

/// All top-level box types in order.
pub fn top_level_types(buf: &[u8]) -> MuxResult<Vec<[u8; 4]>> {
    boxes(buf).map(|header| header.map(|h| h.box_type)).collect()
}

pub fn read_u32(buf: &[u8], offset: usize) -> MuxResult<u32> {
    buf.get(offset..offset + 4)
        .map(BigEndian::read_u32)
        .ok_or_else(|| MuxError::Malformed(format!("Read past end of buffer at {offset}")))
}
