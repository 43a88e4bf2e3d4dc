//! Media track descriptors
//!
//! What a publish session resolves to: codec parameters in the shape a
//! surrounding RTSP/SDP layer consumes, with the FLV-level byte blobs kept
//! bit-exact.

pub mod derive;

use bytes::Bytes;

use crate::error::Result;
use crate::media::aac::SbrExtension;
use crate::media::{AudioSpecificConfig, AvcConfig, SpsInfo};

pub use derive::TrackCollector;

/// Dynamic RTP payload type assigned to derived tracks
pub const RTP_PAYLOAD_TYPE: u8 = 96;

/// An H.264 video track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackH264 {
    /// RTP payload type
    pub payload_type: u8,
    /// Sequence Parameter Set, bit-exact as received
    pub sps: Bytes,
    /// Picture Parameter Set, bit-exact as received
    pub pps: Bytes,
    /// Parameters derived from the SPS
    info: SpsInfo,
}

impl TrackH264 {
    /// Build a track from a SPS/PPS pair, validating the SPS
    pub fn new(sps: Bytes, pps: Bytes) -> Result<Self> {
        let info = SpsInfo::parse(&sps)?;
        Ok(Self {
            payload_type: RTP_PAYLOAD_TYPE,
            sps,
            pps,
            info,
        })
    }

    /// Picture width in pixels
    pub fn width(&self) -> u32 {
        self.info.width
    }

    /// Picture height in pixels
    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// H.264 profile indication
    pub fn profile_idc(&self) -> u8 {
        self.info.profile_idc
    }

    /// Build the AVCDecoderConfigurationRecord announcing this track
    pub fn config_record(&self) -> Result<Bytes> {
        Ok(AvcConfig::from_parameter_sets(self.sps.clone(), self.pps.clone())?.encode())
    }
}

/// An AAC audio track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackAac {
    /// RTP payload type
    pub payload_type: u8,
    /// MPEG-4 audio object type (2 = AAC-LC)
    pub object_type: u8,
    /// Sampling frequency in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channel_count: u8,
    /// SBR/PS extension, when the config signaled one
    pub sbr: Option<SbrExtension>,
}

impl TrackAac {
    pub fn new(object_type: u8, sample_rate: u32, channel_count: u8) -> Self {
        Self {
            payload_type: RTP_PAYLOAD_TYPE,
            object_type,
            sample_rate,
            channel_count,
            sbr: None,
        }
    }

    /// Build a track from a decoded AudioSpecificConfig
    pub fn from_config(config: &AudioSpecificConfig) -> Self {
        Self {
            payload_type: RTP_PAYLOAD_TYPE,
            object_type: config.object_type,
            sample_rate: config.sample_rate,
            channel_count: config.channel_count,
            sbr: config.extension,
        }
    }

    /// Encode the AudioSpecificConfig announcing this track
    pub fn config_bytes(&self) -> Bytes {
        AudioSpecificConfig::new(self.object_type, self.sample_rate, self.channel_count).encode()
    }
}
