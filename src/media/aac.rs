//! MPEG-4 AudioSpecificConfig parsing and encoding
//!
//! RTMP transports AAC in raw form; the sequence header tag carries an
//! AudioSpecificConfig:
//!
//! ```text
//! audioObjectType       5 bits (31 escapes to 32 + 6 bits)
//! samplingFrequencyIndex 4 bits (15 escapes to an explicit 24-bit rate)
//! channelConfiguration  4 bits
//! ```
//!
//! Object types 5 (SBR) and 29 (PS) prefix the core config with an
//! extension sampling frequency; the core object type follows.
//!
//! Reference: ISO/IEC 14496-3 §1.6.2.1

use bytes::{Bytes, BytesMut};

use crate::error::{Result, TrackError};

/// Standard sampling frequencies by index
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC object type: Low Complexity
pub const AOT_AAC_LC: u8 = 2;

/// AAC object type: Spectral Band Replication (HE-AAC)
pub const AOT_SBR: u8 = 5;

/// AAC object type: Parametric Stereo (HE-AACv2)
pub const AOT_PS: u8 = 29;

/// SBR/PS extension parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbrExtension {
    /// Extension object type (5 for SBR, 29 for PS)
    pub object_type: u8,
    /// Extension sampling frequency in Hz
    pub sample_rate: u32,
}

/// Decoded MPEG-4 AudioSpecificConfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Core audio object type (2 = AAC-LC)
    pub object_type: u8,
    /// Core sampling frequency in Hz
    pub sample_rate: u32,
    /// Channel configuration (1 = mono, 2 = stereo, ...)
    pub channel_count: u8,
    /// SBR/PS extension, when signaled
    pub extension: Option<SbrExtension>,
}

impl AudioSpecificConfig {
    /// Config for a plain AAC-LC stream
    pub fn new(object_type: u8, sample_rate: u32, channel_count: u8) -> Self {
        Self {
            object_type,
            sample_rate,
            channel_count,
            extension: None,
        }
    }

    /// Parse an AudioSpecificConfig
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ConfigReader::new(data);

        let outer_type = r.read_object_type()?;
        let outer_rate = r.read_sample_rate()?;
        let channel_count = r.read_bits(4)? as u8;

        if outer_type == AOT_SBR || outer_type == AOT_PS {
            let extension_rate = r.read_sample_rate()?;
            let core_type = r.read_object_type()?;
            return Ok(AudioSpecificConfig {
                object_type: core_type,
                sample_rate: outer_rate,
                channel_count,
                extension: Some(SbrExtension {
                    object_type: outer_type,
                    sample_rate: extension_rate,
                }),
            });
        }

        Ok(AudioSpecificConfig {
            object_type: outer_type,
            sample_rate: outer_rate,
            channel_count,
            extension: None,
        })
    }

    /// Encode to AudioSpecificConfig bytes
    ///
    /// Emits the plain core form; SBR is signaled implicitly by decoders,
    /// which is how FLV muxers announce HE-AAC as well.
    pub fn encode(&self) -> Bytes {
        let mut w = ConfigWriter::new();
        w.write_bits(self.object_type as u32, 5);
        match SAMPLE_RATES.iter().position(|&r| r == self.sample_rate) {
            Some(index) => w.write_bits(index as u32, 4),
            None => {
                w.write_bits(0x0F, 4);
                w.write_bits(self.sample_rate & 0xFF_FFFF, 24);
            }
        }
        w.write_bits(self.channel_count as u32, 4);
        // frameLengthFlag, dependsOnCoreCoder, extensionFlag
        w.write_bits(0, 3);
        w.finish()
    }
}

/// Bit-level reader over a config blob
struct ConfigReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ConfigReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bits(&mut self, n: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            let byte = self
                .data
                .get(self.pos / 8)
                .ok_or(TrackError::InvalidAudioConfig)?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }

    fn read_object_type(&mut self) -> Result<u8> {
        let t = self.read_bits(5)? as u8;
        if t != 31 {
            return Ok(t);
        }
        Ok(32 + self.read_bits(6)? as u8)
    }

    fn read_sample_rate(&mut self) -> Result<u32> {
        let index = self.read_bits(4)? as usize;
        if index == 0x0F {
            return self.read_bits(24);
        }
        SAMPLE_RATES
            .get(index)
            .copied()
            .ok_or_else(|| TrackError::InvalidAudioConfig.into())
    }
}

/// Bit-level writer producing a padded config blob
struct ConfigWriter {
    buf: BytesMut,
    current: u8,
    filled: u8,
}

impl ConfigWriter {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(5),
            current: 0,
            filled: 0,
        }
    }

    fn write_bits(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.current = (self.current << 1) | bit;
            self.filled += 1;
            if self.filled == 8 {
                self.buf.extend_from_slice(&[self.current]);
                self.current = 0;
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Bytes {
        if self.filled > 0 {
            self.current <<= 8 - self.filled;
            self.buf.extend_from_slice(&[self.current]);
        }
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aac_lc_44100_stereo() {
        let config = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(config.object_type, AOT_AAC_LC);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.extension, None);
    }

    #[test]
    fn test_encode_aac_lc_44100_stereo() {
        let config = AudioSpecificConfig::new(AOT_AAC_LC, 44100, 2);
        assert_eq!(&config.encode()[..], &[0x12, 0x10]);
    }

    #[test]
    fn test_roundtrip_all_table_rates() {
        for &rate in &SAMPLE_RATES {
            let config = AudioSpecificConfig::new(AOT_AAC_LC, rate, 2);
            let parsed = AudioSpecificConfig::parse(&config.encode()).unwrap();
            assert_eq!(parsed, config);
        }
    }

    #[test]
    fn test_roundtrip_explicit_rate() {
        let config = AudioSpecificConfig::new(AOT_AAC_LC, 12345, 1);
        let parsed = AudioSpecificConfig::parse(&config.encode()).unwrap();
        assert_eq!(parsed.sample_rate, 12345);
        assert_eq!(parsed.channel_count, 1);
    }

    #[test]
    fn test_parse_sbr_extension() {
        // SBR (type 5), 24000 Hz core, stereo, 48000 Hz extension, AAC-LC core
        // 00101 0110 0010 0011 00010 -> 0x2B 0x11 0x88
        let config = AudioSpecificConfig::parse(&[0x2B, 0x11, 0x88]).unwrap();
        assert_eq!(config.object_type, AOT_AAC_LC);
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.channel_count, 2);
        assert_eq!(
            config.extension,
            Some(SbrExtension {
                object_type: AOT_SBR,
                sample_rate: 48000,
            })
        );
    }

    #[test]
    fn test_truncated_config_is_error() {
        assert!(AudioSpecificConfig::parse(&[0x12]).is_err());
        assert!(AudioSpecificConfig::parse(&[]).is_err());
    }
}
