//! H.264/AVC configuration parsing
//!
//! RTMP transports H.264 in AVCC form; the sequence header tag carries an
//! AVCDecoderConfigurationRecord:
//!
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```
//!
//! The SPS itself is an Annex B RBSP: emulation-prevention bytes are
//! stripped before the Exp-Golomb walk that yields profile, level, and
//! picture dimensions.
//!
//! References: ISO/IEC 14496-15 §5.2.4.1, ITU-T H.264 §7.3.2.1

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TrackError};

/// NAL unit type carried in an SPS
const NALU_TYPE_SPS: u8 = 7;

/// AVC decoder configuration (from the sequence header)
#[derive(Debug, Clone, PartialEq)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, ...)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g. 31 = 3.1)
    pub level: u8,
    /// NALU length prefix size (usually 4)
    pub nalu_length_size: u8,
    /// Sequence Parameter Sets
    pub sps: Vec<Bytes>,
    /// Picture Parameter Sets
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(TrackError::InvalidVideoConfig.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(TrackError::InvalidVideoConfig.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            sps.push(read_parameter_set(&mut data)?);
        }

        if data.is_empty() {
            return Err(TrackError::InvalidVideoConfig.into());
        }
        let num_pps = data.get_u8() as usize;
        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            pps.push(read_parameter_set(&mut data)?);
        }

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Build a record from a single SPS/PPS pair
    ///
    /// Profile, compatibility, and level are lifted from the SPS header
    /// bytes, as the record duplicates them.
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.len() < 4 || pps.is_empty() {
            return Err(TrackError::InvalidVideoConfig.into());
        }

        Ok(AvcConfig {
            profile: sps[1],
            compatibility: sps[2],
            level: sps[3],
            nalu_length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    /// Encode back to an AVCDecoderConfigurationRecord
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 64);
        buf.put_u8(1); // configurationVersion
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        buf.put_u8(0xFC | (self.nalu_length_size - 1)); // 6 reserved bits set
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F)); // 3 reserved bits set
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }
        buf.freeze()
    }
}

fn read_parameter_set(data: &mut Bytes) -> Result<Bytes> {
    if data.len() < 2 {
        return Err(TrackError::InvalidVideoConfig.into());
    }
    let len = data.get_u16() as usize;
    if data.len() < len {
        return Err(TrackError::InvalidVideoConfig.into());
    }
    Ok(data.copy_to_bytes(len))
}

/// Picture parameters derived from a Sequence Parameter Set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    /// Picture width in pixels, after cropping
    pub width: u32,
    /// Picture height in pixels, after cropping
    pub height: u32,
}

impl SpsInfo {
    /// Parse an SPS NAL unit (header byte included)
    pub fn parse(sps: &[u8]) -> Result<Self> {
        if sps.len() < 4 || sps[0] & 0x1F != NALU_TYPE_SPS {
            return Err(TrackError::InvalidVideoConfig.into());
        }

        let rbsp = strip_emulation_prevention(&sps[1..]);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = r.read_bits(8)? as u8;
        let constraint_flags = r.read_bits(8)? as u8;
        let level_idc = r.read_bits(8)? as u8;
        let _sps_id = r.read_ue()?;

        let chroma_format_idc = if has_high_profile_fields(profile_idc) {
            let chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                let _separate_colour_plane = r.read_bit()?;
            }
            let _bit_depth_luma = r.read_ue()?;
            let _bit_depth_chroma = r.read_ue()?;
            let _qpprime_bypass = r.read_bit()?;
            if r.read_bit()? {
                // seq_scaling_matrix_present
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
            chroma_format_idc
        } else {
            1 // 4:2:0
        };

        let _log2_max_frame_num = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        match pic_order_cnt_type {
            0 => {
                let _log2_max_poc_lsb = r.read_ue()?;
            }
            1 => {
                let _delta_always_zero = r.read_bit()?;
                let _offset_non_ref = r.read_se()?;
                let _offset_top_bottom = r.read_se()?;
                let cycles = r.read_ue()?;
                if cycles > 255 {
                    return Err(TrackError::InvalidVideoConfig.into());
                }
                for _ in 0..cycles {
                    let _ = r.read_se()?;
                }
            }
            _ => {}
        }

        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_allowed = r.read_bit()?;
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only = r.read_bit()?;
        if !frame_mbs_only {
            let _mb_adaptive = r.read_bit()?;
        }
        let _direct_8x8 = r.read_bit()?;

        let (crop_left, crop_right, crop_top, crop_bottom) = if r.read_bit()? {
            (r.read_ue()?, r.read_ue()?, r.read_ue()?, r.read_ue()?)
        } else {
            (0, 0, 0, 0)
        };

        let mut width = pic_width_in_mbs_minus1
            .saturating_add(1)
            .saturating_mul(16);
        let mut height = pic_height_in_map_units_minus1
            .saturating_add(1)
            .saturating_mul(16);
        if !frame_mbs_only {
            height = height.saturating_mul(2);
        }

        let crop_unit_x: u32 = if chroma_format_idc == 0 { 1 } else { 2 };
        let crop_unit_y: u32 = {
            let base = if chroma_format_idc == 0 { 1 } else { 2 };
            if frame_mbs_only {
                base
            } else {
                base * 2
            }
        };
        width = width
            .saturating_sub(crop_unit_x.saturating_mul(crop_left.saturating_add(crop_right)));
        height = height
            .saturating_sub(crop_unit_y.saturating_mul(crop_top.saturating_add(crop_bottom)));

        Ok(SpsInfo {
            profile_idc,
            constraint_flags,
            level_idc,
            width,
            height,
        })
    }

    /// Profile name for logs and diagnostics
    pub fn profile_name(&self) -> &'static str {
        match self.profile_idc {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }
}

/// Profiles whose SPS carries the chroma/bit-depth extension block
fn has_high_profile_fields(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Remove 0x03 emulation-prevention bytes from an Annex B RBSP
fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u32;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }
    Ok(())
}

/// Bit-level reader for Exp-Golomb coded parameter sets
struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    fn read_bit(&mut self) -> Result<bool> {
        if self.byte_pos >= self.data.len() {
            return Err(TrackError::InvalidVideoConfig.into());
        }
        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(bit != 0)
    }

    fn read_bits(&mut self, n: u8) -> Result<u32> {
        let mut value: u32 = 0;
        for _ in 0..n {
            value = (value << 1) | (self.read_bit()? as u32);
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb
    fn read_ue(&mut self) -> Result<u32> {
        let mut zeros = 0u8;
        while !self.read_bit()? {
            zeros += 1;
            if zeros > 31 {
                return Err(TrackError::InvalidVideoConfig.into());
            }
        }
        let suffix = self.read_bits(zeros)?;
        Ok(((1u64 << zeros) - 1 + suffix as u64) as u32)
    }

    /// Signed Exp-Golomb
    fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()?;
        let magnitude = ((ue as u64 + 1) / 2) as i32;
        Ok(if ue % 2 == 1 { magnitude } else { -magnitude })
    }
}
