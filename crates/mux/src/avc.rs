//! H.264 parameter sets and NAL framing.
//!
//! Encoders deliver SPS/PPS as one Annex-B codec-config sample and frames
//! as Annex-B access units. Segments need an `AVCDecoderConfigurationRecord`
//! and length-prefixed NAL units.

use dash_common::NalLengthSize;

use crate::error::{MuxError, MuxResult};

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }
}

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Largest number of SPS records an `avcC` can hold (5-bit count).
pub const MAX_SPS: usize = 31;
/// Largest number of PPS records an `avcC` can hold (8-bit count).
pub const MAX_PPS: usize = 255;

fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(ANNEXB_START_CODE.len())
        .position(|w| w == ANNEXB_START_CODE)
}

/// Split an access unit into NAL units.
///
/// Data that does not begin with a 4-byte start code is returned as a
/// single unit. Empty units (back-to-back start codes) are dropped.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    if !data.starts_with(&ANNEXB_START_CODE) {
        return vec![data];
    }
    let mut units = Vec::new();
    let mut rest = &data[ANNEXB_START_CODE.len()..];
    while let Some(pos) = find_start_code(rest) {
        units.push(&rest[..pos]);
        rest = &rest[pos + ANNEXB_START_CODE.len()..];
    }
    units.push(rest);
    units.retain(|unit| !unit.is_empty());
    units
}

/// Convert an Annex-B access unit into length-prefixed NAL units.
pub fn annexb_to_length_prefixed(data: &[u8], length_size: NalLengthSize) -> MuxResult<Vec<u8>> {
    let units = split_annexb(data);
    let prefix = length_size.bytes();
    let mut out = Vec::with_capacity(data.len() + units.len() * prefix);
    for unit in units {
        match length_size {
            NalLengthSize::Two => {
                let len = u16::try_from(unit.len()).map_err(|_| {
                    MuxError::Malformed(format!(
                        "NAL unit of {} bytes does not fit a 2-byte length",
                        unit.len()
                    ))
                })?;
                out.extend_from_slice(&len.to_be_bytes());
            }
            NalLengthSize::Four => {
                let len = u32::try_from(unit.len()).map_err(|_| {
                    MuxError::Malformed(format!("NAL unit of {} bytes is too large", unit.len()))
                })?;
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        out.extend_from_slice(unit);
    }
    Ok(out)
}

/// Decoder configuration for one H.264 track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

/// Accumulates parameter sets in order and enforces their invariants.
#[derive(Default)]
struct ParamSetCollector {
    profile: Option<[u8; 3]>,
    sps: Vec<Vec<u8>>,
    pps: Vec<Vec<u8>>,
}

impl ParamSetCollector {
    fn push_sps(&mut self, nal: &[u8]) -> MuxResult<()> {
        if !self.pps.is_empty() {
            return Err(MuxError::Malformed("SPS after PPS in codec config".into()));
        }
        if nal.len() < 4 {
            return Err(MuxError::Malformed(format!(
                "SPS of {} bytes is too short",
                nal.len()
            )));
        }
        let profile = [nal[1], nal[2], nal[3]];
        match self.profile {
            None => self.profile = Some(profile),
            Some(expected) if expected != profile => {
                return Err(MuxError::Malformed(format!(
                    "Inconsistent SPS profile/level {profile:02x?}, expected {expected:02x?}"
                )));
            }
            Some(_) => {}
        }
        self.sps.push(nal.to_vec());
        Ok(())
    }

    fn push_pps(&mut self, nal: &[u8]) -> MuxResult<()> {
        if self.sps.is_empty() {
            return Err(MuxError::Malformed("PPS before SPS in codec config".into()));
        }
        self.pps.push(nal.to_vec());
        Ok(())
    }

    fn finish(self) -> MuxResult<AvcConfig> {
        let Some([profile_idc, profile_compatibility, level_idc]) = self.profile else {
            return Err(MuxError::Malformed("Codec config has no SPS".into()));
        };
        if self.sps.len() > MAX_SPS {
            return Err(MuxError::Malformed(format!(
                "Too many SPS records: {}",
                self.sps.len()
            )));
        }
        if self.pps.is_empty() {
            return Err(MuxError::Malformed("Codec config has no PPS".into()));
        }
        if self.pps.len() > MAX_PPS {
            return Err(MuxError::Malformed(format!(
                "Too many PPS records: {}",
                self.pps.len()
            )));
        }
        Ok(AvcConfig {
            profile_idc,
            profile_compatibility,
            level_idc,
            sps: self.sps,
            pps: self.pps,
        })
    }
}

impl AvcConfig {
    /// Parse start-code delimited SPS and PPS NAL units.
    pub fn from_annex_b(data: &[u8]) -> MuxResult<Self> {
        if data.len() < 4 {
            return Err(MuxError::Malformed(format!(
                "Codec config of {} bytes is too short",
                data.len()
            )));
        }

        let mut collector = ParamSetCollector::default();
        let mut rest = data;
        while rest.len() > ANNEXB_START_CODE.len() && rest.starts_with(&ANNEXB_START_CODE) {
            let body = &rest[ANNEXB_START_CODE.len()..];
            let len = find_start_code(body).unwrap_or(body.len());
            let nal = &body[..len];
            if nal.is_empty() {
                return Err(MuxError::Malformed("Empty parameter set".into()));
            }
            match H264NalType::from(nal[0]) {
                H264NalType::Sps => collector.push_sps(nal)?,
                H264NalType::Pps => collector.push_pps(nal)?,
                other => {
                    return Err(MuxError::Malformed(format!(
                        "Unexpected NAL type {other:?} in codec config"
                    )));
                }
            }
            rest = &body[len..];
        }
        collector.finish()
    }

    /// Parse an existing `AVCDecoderConfigurationRecord`.
    pub fn from_record(record: &[u8]) -> MuxResult<Self> {
        let truncated = || MuxError::Malformed("Truncated avcC record".into());
        if record.len() < 7 {
            return Err(truncated());
        }
        if record[0] != 1 {
            return Err(MuxError::Malformed(format!(
                "Unknown avcC version {}",
                record[0]
            )));
        }

        let mut collector = ParamSetCollector::default();
        let mut pos = 5;
        let sps_count = (record[pos] & 0x1F) as usize;
        pos += 1;
        let read_set = |pos: &mut usize| -> MuxResult<Vec<u8>> {
            let len_bytes = record.get(*pos..*pos + 2).ok_or_else(truncated)?;
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            *pos += 2;
            let set = record.get(*pos..*pos + len).ok_or_else(truncated)?;
            *pos += len;
            if set.is_empty() {
                return Err(MuxError::Malformed("Empty parameter set".into()));
            }
            Ok(set.to_vec())
        };
        for _ in 0..sps_count {
            let sps = read_set(&mut pos)?;
            collector.push_sps(&sps)?;
        }
        let pps_count = *record.get(pos).ok_or_else(truncated)? as usize;
        pos += 1;
        for _ in 0..pps_count {
            let pps = read_set(&mut pos)?;
            collector.push_pps(&pps)?;
        }
        collector.finish()
    }

    /// Serialize as an `AVCDecoderConfigurationRecord`.
    pub fn to_record(&self, length_size: NalLengthSize) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            7 + self.sps.iter().chain(&self.pps).map(|s| s.len() + 2).sum::<usize>(),
        );
        out.push(1); // configurationVersion
        out.push(self.profile_idc);
        out.push(self.profile_compatibility);
        out.push(self.level_idc);
        out.push(0xFC | (length_size.bytes() as u8 - 1));
        out.push(0xE0 | self.sps.len() as u8);
        for sps in &self.sps {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps.len() as u8);
        for pps in &self.pps {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }
}
