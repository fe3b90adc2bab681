//! MPEG-4 elementary stream descriptors (`esds`) for AAC.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::atoms::BoxWriter;
use crate::error::{MuxError, MuxResult};

const ES_DESCR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCR_TAG: u8 = 0x04;
const DECODER_SPECIFIC_INFO_TAG: u8 = 0x05;
const SL_CONFIG_DESCR_TAG: u8 = 0x06;

/// Write the esds box for an AAC track carrying `dsi` (AudioSpecificConfig).
pub fn write_esds(writer: &mut BoxWriter, dsi: &[u8]) -> MuxResult<()> {
    writer.begin_full_box(b"esds", 0, 0)?;

    let dec_config_len = 13 + descr_size(dsi.len());
    let es_desc_len = 3 + descr_size(dec_config_len) + descr_size(1);

    writer.write_u8(ES_DESCR_TAG)?;
    write_descr_length(writer, es_desc_len)?;
    writer.write_u16::<BigEndian>(0)?; // ES_ID
    writer.write_u8(0)?; // flags + stream priority

    writer.write_u8(DECODER_CONFIG_DESCR_TAG)?;
    write_descr_length(writer, dec_config_len)?;
    writer.write_u8(0x40)?; // objectTypeIndication = Audio ISO/IEC 14496-3 (AAC)
    writer.write_u8(0x15)?; // streamType = Audio stream
    writer.write_u16::<BigEndian>(0x03)?; // bufferSizeDB (24-bit) = 0x000300
    writer.write_u8(0x00)?;
    writer.write_u32::<BigEndian>(96_000)?; // maxBitrate
    writer.write_u32::<BigEndian>(96_000)?; // avgBitrate

    writer.write_u8(DECODER_SPECIFIC_INFO_TAG)?;
    write_descr_length(writer, dsi.len())?;
    writer.write_all(dsi)?;

    writer.write_u8(SL_CONFIG_DESCR_TAG)?;
    write_descr_length(writer, 1)?;
    writer.write_u8(0x02)?; // predefined = MP4

    writer.end_box()
}

/// Total size of a descriptor with `payload` bytes of content.
fn descr_size(payload: usize) -> usize {
    let mut len_bytes = 1;
    let mut rest = payload >> 7;
    while rest > 0 {
        len_bytes += 1;
        rest >>= 7;
    }
    1 + len_bytes + payload
}

/// Write MPEG-4 descriptor length in expandable form (1-4 bytes).
fn write_descr_length<W: Write>(writer: &mut W, len: usize) -> MuxResult<()> {
    if len < 128 {
        writer.write_u8(len as u8)?;
        return Ok(());
    }
    let mut val = len;
    let mut bytes = Vec::new();
    loop {
        bytes.push((val & 0x7F) as u8);
        val >>= 7;
        if val == 0 {
            break;
        }
    }
    bytes.reverse();
    let last = bytes.len() - 1;
    for (i, b) in bytes.iter().enumerate() {
        writer.write_u8(if i < last { b | 0x80 } else { *b })?;
    }
    Ok(())
}

/// Cursor over descriptor bytes.
struct DescrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DescrReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn truncated() -> MuxError {
        MuxError::Malformed("Truncated ES descriptor".into())
    }

    fn u8(&mut self) -> MuxResult<u8> {
        let b = *self.data.get(self.pos).ok_or_else(Self::truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> MuxResult<()> {
        if self.pos + n > self.data.len() {
            return Err(Self::truncated());
        }
        self.pos += n;
        Ok(())
    }

    /// Read a descriptor header, returning its tag and content.
    fn descriptor(&mut self) -> MuxResult<(u8, &'a [u8])> {
        let tag = self.u8()?;
        let mut len = 0usize;
        for _ in 0..4 {
            let b = self.u8()?;
            len = (len << 7) | (b & 0x7F) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        let start = self.pos;
        self.skip(len)?;
        Ok((tag, &self.data[start..start + len]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Extract the DecoderSpecificInfo (AudioSpecificConfig) from an ES descriptor.
///
/// Accepts the descriptor with or without the esds version/flags word.
pub fn decoder_specific_info(esds: &[u8]) -> MuxResult<Vec<u8>> {
    let data = match esds {
        [ES_DESCR_TAG, ..] => esds,
        [0, 0, 0, 0, ES_DESCR_TAG, ..] => &esds[4..],
        _ => {
            return Err(MuxError::Malformed(
                "ESDS does not start with an ES descriptor".into(),
            ))
        }
    };

    let (_, es) = DescrReader::new(data).descriptor()?;
    let mut es = DescrReader::new(es);
    es.skip(2)?; // ES_ID
    let flags = es.u8()?;
    if flags & 0x80 != 0 {
        es.skip(2)?; // dependsOn_ES_ID
    }
    if flags & 0x40 != 0 {
        let url_len = es.u8()? as usize;
        es.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        es.skip(2)?; // OCR_ES_Id
    }

    while es.remaining() > 0 {
        let (tag, body) = es.descriptor()?;
        if tag != DECODER_CONFIG_DESCR_TAG {
            continue;
        }
        let mut config = DescrReader::new(body);
        config.skip(13)?;
        while config.remaining() > 0 {
            let (tag, info) = config.descriptor()?;
            if tag == DECODER_SPECIFIC_INFO_TAG {
                return Ok(info.to_vec());
            }
        }
    }
    Err(MuxError::Malformed(
        "ESDS has no decoder specific info".into(),
    ))
}
