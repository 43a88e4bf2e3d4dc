//! Track derivation from a publish session's opening tags
//!
//! Real encoders are inconsistent about announcing their streams: some send
//! a full `onMetaData` with codec ids, some send metadata without them, some
//! send none at all. The collector tolerates all three:
//!
//! - metadata declaring codec ids pins the expected track set, and
//!   resolution waits for every declared config tag;
//! - otherwise the first video config resolves the session, taking along
//!   whatever audio config arrived first.

use bytes::Bytes;

use crate::amf::AmfObject;
use crate::error::{ProtocolError, Result, TrackError};
use crate::media::flv;
use crate::media::{AudioSpecificConfig, AvcConfig};
use crate::track::{TrackAac, TrackH264};

/// Collects metadata and codec-config tags until tracks can be produced
#[derive(Debug, Default)]
pub struct TrackCollector {
    /// `onMetaData` arrived and declared a video codec
    video_declared: Option<bool>,
    /// `onMetaData` arrived and declared an audio codec
    audio_declared: Option<bool>,
    metadata_seen: bool,
    video: Option<TrackH264>,
    audio: Option<TrackAac>,
}

impl TrackCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest an `onMetaData` map
    pub fn ingest_metadata(&mut self, map: &AmfObject) -> Result<()> {
        self.metadata_seen = true;

        if let Some(id) = map.get_number("videocodecid") {
            match id as u8 {
                flv::VIDEO_H264 => self.video_declared = Some(true),
                0 => self.video_declared = Some(false),
                other => return Err(TrackError::UnsupportedVideoCodec(other).into()),
            }
        }

        if let Some(id) = map.get_number("audiocodecid") {
            match id as u8 {
                flv::SOUND_AAC => self.audio_declared = Some(true),
                0 => self.audio_declared = Some(false),
                other => return Err(TrackError::UnsupportedAudioCodec(other).into()),
            }
        }

        tracing::debug!(
            video = ?self.video_declared,
            audio = ?self.audio_declared,
            "metadata ingested"
        );
        Ok(())
    }

    /// Ingest a video tag (FLV body, type 0x09)
    pub fn ingest_video(&mut self, body: &Bytes) -> Result<()> {
        if self.video.is_some() || body.is_empty() {
            return Ok(());
        }

        let codec = flv::video_codec_id(body[0]);
        if codec != flv::VIDEO_H264 {
            return Err(TrackError::UnsupportedVideoCodec(codec).into());
        }

        if !flv::is_video_sequence_header(body) {
            // A frame can't be decoded without its parameter sets
            return Err(ProtocolError::FrameBeforeCodecConfig.into());
        }

        if body.len() < 5 {
            return Err(TrackError::InvalidVideoConfig.into());
        }
        let config = AvcConfig::parse(body.slice(5..))?;
        let sps = config
            .sps
            .first()
            .cloned()
            .ok_or(TrackError::InvalidVideoConfig)?;
        let pps = config
            .pps
            .first()
            .cloned()
            .ok_or(TrackError::InvalidVideoConfig)?;

        let track = TrackH264::new(sps, pps)?;
        tracing::debug!(
            width = track.width(),
            height = track.height(),
            profile = track.profile_idc(),
            "video track resolved"
        );
        self.video = Some(track);
        Ok(())
    }

    /// Ingest an audio tag (FLV body, type 0x08)
    pub fn ingest_audio(&mut self, body: &Bytes) -> Result<()> {
        if self.audio.is_some() || body.is_empty() {
            return Ok(());
        }

        let codec = flv::audio_codec_id(body[0]);
        if codec != flv::SOUND_AAC {
            return Err(TrackError::UnsupportedAudioCodec(codec).into());
        }

        if !flv::is_audio_sequence_header(body) {
            // Raw AAC frames ahead of the config carry nothing derivable
            return Ok(());
        }

        let config = AudioSpecificConfig::parse(&body[2..])?;
        let track = TrackAac::from_config(&config);
        tracing::debug!(
            sample_rate = track.sample_rate,
            channels = track.channel_count,
            "audio track resolved"
        );
        self.audio = Some(track);
        Ok(())
    }

    /// Whether the expected track set has been resolved
    pub fn resolved(&self) -> bool {
        if self.metadata_seen && (self.video_declared.is_some() || self.audio_declared.is_some())
        {
            // Declared mode: every announced track must have its config
            let video_ok = self.video_declared != Some(true) || self.video.is_some();
            let audio_ok = self.audio_declared != Some(true) || self.audio.is_some();
            video_ok && audio_ok
        } else {
            // Inference mode: the video config closes the derivation window
            self.video.is_some()
        }
    }

    /// Yield the derived tracks
    pub fn finish(self) -> (Option<TrackH264>, Option<TrackAac>) {
        (self.video, self.audio)
    }
}
