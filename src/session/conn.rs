//! Public connection facade
//!
//! `Conn` wraps an established bidirectional byte stream and drives it
//! through handshake -> connect -> createStream -> (publish | play). The
//! publish path ends in `read_tracks`, which runs the ingest dialogue until
//! the peer's opening tags yield track descriptors; the play path ends in
//! `write_tracks`, which announces the given tracks to the peer. After
//! either, `read_message`/`write_message` pump raw media, and `into_split`
//! hands out independent halves for full-duplex operation.
//!
//! The facade never opens sockets: callers pass any `AsyncRead + AsyncWrite`
//! stream. URL handling is limited to pulling `app`/`stream` out of the
//! connect path.

use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use crate::amf::{AmfObject, AmfValue};
use crate::error::{Error, Result, TrackError};
use crate::media::flv;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{Command, DataMessage, Message, MessageKind, UserControlEvent};
use crate::session::state::SessionState;
use crate::track::{TrackAac, TrackCollector, TrackH264};

/// Connection tuning knobs
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Deadline for each read operation; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    /// Deadline for each write operation; `None` waits indefinitely
    pub write_timeout: Option<Duration>,
    /// Chunk size advertised (and switched to) after `connect`
    pub chunk_size: u32,
    /// Window acknowledgement size advertised after `connect`
    pub window_ack_size: u32,
    /// Peer bandwidth advertised after `connect`
    pub peer_bandwidth: u32,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            chunk_size: SERVER_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
        }
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(d) => timeout(d, fut).await.map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

/// Reading half: chunk reassembly plus inbound flow-control bookkeeping
///
/// Owns its own chunk-stream state table; Set Chunk Size and Abort from the
/// peer are applied here transparently (and still surfaced to the caller).
pub struct MessageReader<R> {
    io: BufReader<R>,
    buf: BytesMut,
    decoder: ChunkDecoder,
    read_timeout: Option<Duration>,
    bytes_received: u64,
    bytes_acked: u64,
    peer_window: Option<u32>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    fn new(io: R, read_timeout: Option<Duration>) -> Self {
        Self {
            io: BufReader::new(io),
            buf: BytesMut::with_capacity(8 * 1024),
            decoder: ChunkDecoder::new(),
            read_timeout,
            bytes_received: 0,
            bytes_acked: 0,
            peer_window: None,
        }
    }

    /// Read the next complete message
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.buf)? {
                self.apply_control(&msg);
                return Ok(msg);
            }

            let deadline = self.read_timeout;
            let Self { io, buf, .. } = self;
            let n = with_deadline(deadline, async {
                io.read_buf(buf).await.map_err(Error::from)
            })
            .await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            self.bytes_received += n as u64;
        }
    }

    /// Apply inbound protocol control to reader-owned state
    fn apply_control(&mut self, msg: &Message) {
        match msg.type_id {
            MSG_SET_CHUNK_SIZE if msg.payload.len() >= 4 => {
                let size = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]) & 0x7FFF_FFFF;
                tracing::debug!(size, "peer chunk size");
                self.decoder.set_chunk_size(size);
            }
            MSG_ABORT if msg.payload.len() >= 4 => {
                let csid = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]);
                self.decoder.abort(csid);
            }
            MSG_WINDOW_ACK_SIZE if msg.payload.len() >= 4 => {
                let size = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]);
                self.peer_window = Some(size);
            }
            _ => {}
        }
    }

    /// Sequence number to acknowledge, when a window's worth of bytes has
    /// arrived since the last acknowledgement
    pub fn due_ack(&mut self) -> Option<u32> {
        let window = self.peer_window? as u64;
        if window == 0 {
            return None;
        }
        if self.bytes_received - self.bytes_acked >= window {
            self.bytes_acked = self.bytes_received;
            Some(self.bytes_received as u32)
        } else {
            None
        }
    }
}

/// Writing half: chunk fragmentation over a buffered writer
pub struct MessageWriter<W> {
    io: BufWriter<W>,
    encoder: ChunkEncoder,
    scratch: BytesMut,
    write_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    fn new(io: W, write_timeout: Option<Duration>) -> Self {
        Self {
            io: BufWriter::new(io),
            encoder: ChunkEncoder::new(),
            scratch: BytesMut::with_capacity(8 * 1024),
            write_timeout,
        }
    }

    /// Encode and send one message
    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        self.scratch.clear();
        self.encoder.encode(msg, &mut self.scratch);

        let deadline = self.write_timeout;
        let Self { io, scratch, .. } = self;
        with_deadline(deadline, async {
            io.write_all(&scratch[..]).await?;
            io.flush().await?;
            Ok(())
        })
        .await
    }

    /// Raise the outbound chunk size (after a Set Chunk Size was sent)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.encoder.set_chunk_size(size);
    }
}

/// An RTMP connection over an established byte stream
pub struct Conn<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
    state: SessionState,
    config: ConnConfig,
    app: String,
    stream: String,
    /// Message stream id handed out by `createStream`
    assigned_stream_id: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, ConnConfig::default())
    }

    pub fn with_config(stream: S, config: ConnConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read_half, config.read_timeout),
            writer: MessageWriter::new(write_half, config.write_timeout),
            state: SessionState::AwaitHandshake,
            config,
            app: String::new(),
            stream: String::new(),
            assigned_stream_id: 1,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Application name from the connect path
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Stream name from the connect path or the publish/play argument
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Run the server side of the handshake
    pub async fn server_handshake(&mut self) -> Result<()> {
        let deadline = self.config.read_timeout;
        let Self { reader, writer, .. } = self;
        with_deadline(deadline, handshake::server_handshake(&mut reader.io, &mut writer.io))
            .await?;
        self.state = SessionState::AwaitConnect;
        Ok(())
    }

    /// Run the client side of the handshake
    pub async fn client_handshake(&mut self) -> Result<()> {
        let deadline = self.config.read_timeout;
        let Self { reader, writer, .. } = self;
        with_deadline(deadline, handshake::client_handshake(&mut reader.io, &mut writer.io))
            .await?;
        self.state = SessionState::AwaitConnect;
        Ok(())
    }

    /// Read one message, emitting acknowledgements as the peer's window
    /// fills up
    pub async fn read_message(&mut self) -> Result<Message> {
        let msg = self.reader.read_message().await?;
        if let Some(sequence) = self.reader.due_ack() {
            self.writer
                .write_message(&Message::acknowledgement(sequence))
                .await?;
        }
        Ok(msg)
    }

    /// Send one message
    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        self.writer.write_message(msg).await
    }

    /// Serve the publish-ingest dialogue and derive the published tracks
    ///
    /// Runs connect/createStream/publish, then collects metadata and
    /// codec-config tags until the track set resolves. A peer close before
    /// resolution is `TrackError::MissingVideoConfig`.
    pub async fn read_tracks(&mut self) -> Result<(Option<TrackH264>, Option<TrackAac>)> {
        let mut collector = TrackCollector::new();

        loop {
            let msg = match self.read_message().await {
                Ok(msg) => msg,
                Err(Error::Closed) if self.state == SessionState::ReadingTracks => {
                    self.state = SessionState::Closed;
                    return Err(TrackError::MissingVideoConfig.into());
                }
                Err(e) => return Err(e),
            };

            match MessageKind::classify(&msg)? {
                MessageKind::Command(cmd) => match cmd.name.as_str() {
                    CMD_CONNECT => self.handle_connect(&cmd).await?,
                    CMD_CREATE_STREAM => self.handle_create_stream(&cmd).await?,
                    CMD_PUBLISH => self.handle_publish(&cmd).await?,
                    CMD_PLAY => return Err(Error::UnexpectedCommand(cmd.name)),
                    CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_FC_UNPUBLISH | CMD_CHECK_BW
                    | CMD_GET_STREAM_LENGTH | CMD_DELETE_STREAM | CMD_CLOSE_STREAM => {
                        tracing::trace!(command = %cmd.name, "accepted silently");
                    }
                    other => {
                        tracing::trace!(command = other, "unrecognized command ignored");
                    }
                },

                MessageKind::Data(data) if self.state == SessionState::ReadingTracks => {
                    if let Some(map) = data.metadata() {
                        collector.ingest_metadata(map)?;
                    }
                }

                MessageKind::Video { data, .. }
                    if self.state == SessionState::ReadingTracks =>
                {
                    collector.ingest_video(&data)?;
                }

                MessageKind::Audio { data, .. }
                    if self.state == SessionState::ReadingTracks =>
                {
                    collector.ingest_audio(&data)?;
                }

                // Control messages were applied by the reader; anything else
                // ahead of its phase is noise real encoders produce.
                _ => {}
            }

            if self.state == SessionState::ReadingTracks && collector.resolved() {
                self.state = SessionState::PublishReady;
                tracing::info!(app = %self.app, stream = %self.stream, "tracks resolved");
                return Ok(collector.finish());
            }
        }
    }

    /// Serve the play-egress dialogue and announce the given tracks
    ///
    /// Runs connect/createStream/play, then emits the stream events, status
    /// burst, metadata, and codec-config tags. Returns once the
    /// configuration tags are on the wire.
    pub async fn write_tracks(
        &mut self,
        video: Option<&TrackH264>,
        audio: Option<&TrackAac>,
    ) -> Result<()> {
        loop {
            let msg = self.read_message().await?;

            match MessageKind::classify(&msg)? {
                MessageKind::Command(cmd) => match cmd.name.as_str() {
                    CMD_CONNECT => self.handle_connect(&cmd).await?,
                    CMD_CREATE_STREAM => self.handle_create_stream(&cmd).await?,
                    CMD_PLAY => {
                        self.handle_play(&cmd, video, audio).await?;
                        return Ok(());
                    }
                    CMD_PUBLISH => return Err(Error::UnexpectedCommand(cmd.name)),
                    CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_FC_UNPUBLISH | CMD_CHECK_BW
                    | CMD_GET_STREAM_LENGTH | CMD_DELETE_STREAM | CMD_CLOSE_STREAM => {
                        tracing::trace!(command = %cmd.name, "accepted silently");
                    }
                    other => {
                        tracing::trace!(command = other, "unrecognized command ignored");
                    }
                },
                _ => {}
            }
        }
    }

    /// Split into independent halves for full-duplex media pumping
    pub fn into_split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }

    async fn handle_connect(&mut self, cmd: &Command) -> Result<()> {
        if self.state != SessionState::AwaitConnect {
            return Err(Error::UnexpectedCommand(CMD_CONNECT.into()));
        }

        let object = cmd.command_object.as_object();
        let path = object
            .and_then(|o| o.get_str("tcUrl"))
            .and_then(url_path)
            .map(str::to_string)
            .or_else(|| {
                object.and_then(|o| o.get_str("app")).map(|app| {
                    if app.starts_with('/') {
                        app.to_string()
                    } else {
                        format!("/{}", app)
                    }
                })
            })
            .unwrap_or_default();
        let (app, stream) = split_app_stream(&path);
        self.app = app;
        self.stream = stream;

        self.writer
            .write_message(&Message::window_ack_size(self.config.window_ack_size))
            .await?;
        self.writer
            .write_message(&Message::set_peer_bandwidth(
                self.config.peer_bandwidth,
                BANDWIDTH_LIMIT_DYNAMIC,
            ))
            .await?;
        self.writer
            .write_message(&Message::set_chunk_size(self.config.chunk_size))
            .await?;
        self.writer.set_chunk_size(self.config.chunk_size);

        let properties = AmfObject::from([
            ("fmsVer", AmfValue::from(SERVER_FMS_VERSION)),
            ("capabilities", AmfValue::from(SERVER_CAPABILITIES)),
        ]);
        let info = AmfObject::from([
            ("level", AmfValue::from("status")),
            ("code", AmfValue::from(NC_CONNECT_SUCCESS)),
            ("description", AmfValue::from("Connection succeeded.")),
            ("objectEncoding", AmfValue::from(0.0)),
        ]);
        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Object(properties),
            AmfValue::Object(info),
        );
        self.writer
            .write_message(&result.to_message(CSID_COMMAND, 0))
            .await?;

        self.state = SessionState::AwaitCreateStream;
        tracing::info!(app = %self.app, "connect accepted");
        Ok(())
    }

    async fn handle_create_stream(&mut self, cmd: &Command) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::AwaitCreateStream | SessionState::AwaitPublishOrPlay
        ) {
            return Err(Error::UnexpectedCommand(CMD_CREATE_STREAM.into()));
        }

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Number(self.assigned_stream_id as f64),
        );
        self.writer
            .write_message(&result.to_message(CSID_COMMAND, 0))
            .await?;

        self.state = SessionState::AwaitPublishOrPlay;
        tracing::debug!(stream_id = self.assigned_stream_id, "stream created");
        Ok(())
    }

    async fn handle_publish(&mut self, cmd: &Command) -> Result<()> {
        if self.state != SessionState::AwaitPublishOrPlay {
            return Err(Error::UnexpectedCommand(CMD_PUBLISH.into()));
        }

        if let Some(name) = cmd.arguments.first().and_then(|v| v.as_str()) {
            if !name.is_empty() {
                self.stream = name.to_string();
            }
        }

        let status = Command::on_status(cmd.transaction_id, NS_PUBLISH_START, "publish start");
        self.writer
            .write_message(&status.to_message(CSID_STREAM_STATUS, cmd.stream_id))
            .await?;

        self.state = SessionState::ReadingTracks;
        tracing::info!(app = %self.app, stream = %self.stream, "publish accepted");
        Ok(())
    }

    async fn handle_play(
        &mut self,
        cmd: &Command,
        video: Option<&TrackH264>,
        audio: Option<&TrackAac>,
    ) -> Result<()> {
        if self.state != SessionState::AwaitPublishOrPlay {
            return Err(Error::UnexpectedCommand(CMD_PLAY.into()));
        }

        if let Some(name) = cmd.arguments.first().and_then(|v| v.as_str()) {
            if !name.is_empty() {
                self.stream = name.to_string();
            }
        }

        let sid = self.assigned_stream_id;

        self.writer
            .write_message(&Message::user_control(&UserControlEvent::StreamIsRecorded(
                sid,
            )))
            .await?;
        self.writer
            .write_message(&Message::user_control(&UserControlEvent::StreamBegin(sid)))
            .await?;

        for (code, description) in [
            (NS_PLAY_RESET, "play reset"),
            (NS_PLAY_START, "play start"),
            (NS_DATA_START, "data start"),
            (NS_PLAY_PUBLISH_NOTIFY, "publish notify"),
        ] {
            let status = Command::on_status(cmd.transaction_id, code, description);
            self.writer
                .write_message(&status.to_message(CSID_STREAM_STATUS, sid))
                .await?;
        }

        // onMetaData, keys for absent tracks omitted
        let mut map = AmfObject::new();
        if video.is_some() {
            map.push("videodatarate", 0.0);
            map.push("videocodecid", flv::VIDEO_H264 as f64);
        }
        if audio.is_some() {
            map.push("audiodatarate", 0.0);
            map.push("audiocodecid", flv::SOUND_AAC as f64);
        }
        let metadata = DataMessage {
            name: CMD_ON_METADATA.to_string(),
            values: vec![AmfValue::Object(map)],
            stream_id: sid,
        };
        self.writer
            .write_message(&metadata.to_message(CSID_AUDIO, sid))
            .await?;

        if let Some(track) = video {
            let record = track.config_record()?;
            let mut body = BytesMut::with_capacity(5 + record.len());
            body.put_u8(flv::video_tag_header());
            body.put_slice(&[flv::AVC_SEQUENCE_HEADER, 0, 0, 0]);
            body.put_slice(&record);
            self.writer
                .write_message(&Message::new(CSID_VIDEO, MSG_VIDEO, sid, 0, body.freeze()))
                .await?;
        }

        if let Some(track) = audio {
            let config = track.config_bytes();
            let mut body = BytesMut::with_capacity(2 + config.len());
            body.put_u8(flv::audio_tag_header());
            body.put_u8(flv::AAC_SEQUENCE_HEADER);
            body.put_slice(&config);
            self.writer
                .write_message(&Message::new(CSID_AUDIO, MSG_AUDIO, sid, 0, body.freeze()))
                .await?;
        }

        self.state = SessionState::PlayReady;
        tracing::info!(app = %self.app, stream = %self.stream, "play started");
        Ok(())
    }
}

/// Extract the path portion of an `rtmp://host:port/...` URL
fn url_path(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let path = match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    };
    Some(path.split('?').next().unwrap_or(path))
}

/// Split a connect path into app and stream
///
/// `/{app}`, `/{app}/{stream}`, and multi-segment forms where the first two
/// segments are the app and the remainder the stream.
fn split_app_stream(path: &str) -> (String, String) {
    let segs: Vec<&str> = path.split('/').collect();
    match segs.len() {
        0 | 1 => (String::new(), String::new()),
        2 => (segs[1].to_string(), String::new()),
        3 => (segs[1].to_string(), segs[2].to_string()),
        _ => (segs[1..3].join("/"), segs[3..].join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::amf0;
    use crate::error::ProtocolError;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    const SPS: [u8; 21] = [
        0x67, 0x64, 0x00, 0x0c, 0xac, 0x3b, 0x50, 0xb0, 0x4b, 0x42, 0x00, 0x00, 0x03, 0x00,
        0x02, 0x00, 0x00, 0x03, 0x00, 0x3d, 0x08,
    ];
    const PPS: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("rtmp://127.0.0.1:1935/stream"), Some("/stream"));
        assert_eq!(
            url_path("rtmp://host/app/key?token=x"),
            Some("/app/key")
        );
        assert_eq!(url_path("rtmp://host"), Some("/"));
        assert_eq!(url_path("garbage"), None);
    }

    #[test]
    fn test_split_app_stream() {
        assert_eq!(split_app_stream("/stream"), ("stream".into(), "".into()));
        assert_eq!(
            split_app_stream("/live/key"),
            ("live".into(), "key".into())
        );
        assert_eq!(
            split_app_stream("/org/live/key"),
            ("org/live".into(), "key".into())
        );
        assert_eq!(
            split_app_stream("/org/live/key/extra"),
            ("org/live".into(), "key/extra".into())
        );
        assert_eq!(split_app_stream("/"), ("".into(), "".into()));
    }

    // === scripted-peer helpers ===

    fn chunk0(csid: u8, type_id: u8, stream_id: u32, body_len: usize, fragment: &[u8]) -> Vec<u8> {
        let mut out = vec![
            csid,
            0,
            0,
            0,
            (body_len >> 16) as u8,
            (body_len >> 8) as u8,
            body_len as u8,
            type_id,
        ];
        out.extend_from_slice(&stream_id.to_le_bytes());
        out.extend_from_slice(fragment);
        out
    }

    fn chunk1(csid: u8, type_id: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![
            0x40 | csid,
            0,
            0,
            0,
            (body.len() >> 16) as u8,
            (body.len() >> 8) as u8,
            body.len() as u8,
            type_id,
        ];
        out.extend_from_slice(body);
        out
    }

    fn chunk3(csid: u8, fragment: &[u8]) -> Vec<u8> {
        let mut out = vec![0xC0 | csid];
        out.extend_from_slice(fragment);
        out
    }

    async fn peer_handshake<R, W>(rd: &mut R, wr: &mut W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        wr.write_all(&[3u8]).await.unwrap();
        wr.write_all(&[9u8; HANDSHAKE_SIZE]).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + HANDSHAKE_SIZE * 2];
        rd.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], 3);
        // S2 echoes C1
        assert_eq!(&s0s1s2[1 + HANDSHAKE_SIZE + 8..], &[9u8; HANDSHAKE_SIZE - 8][..]);

        // C2 echoes S1
        wr.write_all(&s0s1s2[1..1 + HANDSHAKE_SIZE]).await.unwrap();
    }

    fn connect_body() -> Bytes {
        let object = AmfObject::from([
            ("app", AmfValue::from("/stream")),
            ("flashVer", AmfValue::from("LNX 9,0,124,2")),
            ("tcUrl", AmfValue::from("rtmp://127.0.0.1:1935/stream")),
            ("fpad", AmfValue::from(false)),
            ("capabilities", AmfValue::from(15.0)),
            ("audioCodecs", AmfValue::from(4071.0)),
            ("videoCodecs", AmfValue::from(252.0)),
            ("videoFunction", AmfValue::from(1.0)),
        ]);
        amf0::encode_all(&[
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Object(object),
        ])
    }

    async fn send_connect<W: AsyncWrite + Unpin>(wr: &mut W) {
        let body = connect_body();
        assert!(body.len() > 128);
        wr.write_all(&chunk0(3, MSG_COMMAND_AMF0, 0, body.len(), &body[..128]))
            .await
            .unwrap();
        wr.write_all(&chunk3(3, &body[128..])).await.unwrap();
    }

    /// Read and assert the server's connect reply sequence
    async fn expect_connect_replies<R: AsyncRead + Unpin>(mr: &mut MessageReader<R>) {
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (2, MSG_WINDOW_ACK_SIZE));
        assert_eq!(&msg.payload[..], &[0x00, 38, 37, 160]);

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (2, MSG_SET_PEER_BANDWIDTH));
        assert_eq!(&msg.payload[..], &[0x00, 0x26, 0x25, 0xA0, 0x02]);

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (2, MSG_SET_CHUNK_SIZE));
        assert_eq!(&msg.payload[..], &[0x00, 0x01, 0x00, 0x00]);

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (3, MSG_COMMAND_AMF0));
        let values = amf0::decode_all(&msg.payload).unwrap();
        assert_eq!(
            values,
            vec![
                AmfValue::String("_result".into()),
                AmfValue::Number(1.0),
                AmfValue::Object(AmfObject::from([
                    ("fmsVer", AmfValue::from("LNX 9,0,124,2")),
                    ("capabilities", AmfValue::from(31.0)),
                ])),
                AmfValue::Object(AmfObject::from([
                    ("level", AmfValue::from("status")),
                    ("code", AmfValue::from("NetConnection.Connect.Success")),
                    ("description", AmfValue::from("Connection succeeded.")),
                    ("objectEncoding", AmfValue::from(0.0)),
                ])),
            ]
        );
    }

    /// Drive the dialogue from connect through the publish onStatus
    async fn drive_to_publish<R, W>(rd: R, wr: &mut W) -> MessageReader<R>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        send_connect(wr).await;

        let mut mr = MessageReader::new(rd, None);
        expect_connect_replies(&mut mr).await;

        // C->S set chunk size
        wr.write_all(&chunk0(2, MSG_SET_CHUNK_SIZE, 0, 4, &[0x00, 0x01, 0x00, 0x00]))
            .await
            .unwrap();

        // releaseStream / FCPublish, ignored by the server
        let release = amf0::encode_all(&[
            AmfValue::String("releaseStream".into()),
            AmfValue::Number(2.0),
            AmfValue::Null,
            AmfValue::String("".into()),
        ]);
        wr.write_all(&chunk1(3, MSG_COMMAND_AMF0, &release)).await.unwrap();

        let fc_publish = amf0::encode_all(&[
            AmfValue::String("FCPublish".into()),
            AmfValue::Number(3.0),
            AmfValue::Null,
            AmfValue::String("".into()),
        ]);
        wr.write_all(&chunk1(3, MSG_COMMAND_AMF0, &fc_publish)).await.unwrap();

        // createStream rides a Type-3 chunk, inheriting FCPublish's header
        let create = amf0::encode_all(&[
            AmfValue::String("createStream".into()),
            AmfValue::Number(4.0),
            AmfValue::Null,
        ]);
        assert_eq!(create.len(), fc_publish.len());
        wr.write_all(&chunk3(3, &create)).await.unwrap();

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (3, MSG_COMMAND_AMF0));
        assert_eq!(
            amf0::decode_all(&msg.payload).unwrap(),
            vec![
                AmfValue::String("_result".into()),
                AmfValue::Number(4.0),
                AmfValue::Null,
                AmfValue::Number(1.0),
            ]
        );

        // publish on the created stream
        let publish = amf0::encode_all(&[
            AmfValue::String("publish".into()),
            AmfValue::Number(5.0),
            AmfValue::Null,
            AmfValue::String("".into()),
            AmfValue::String("live".into()),
        ]);
        wr.write_all(&chunk0(8, MSG_COMMAND_AMF0, 1, publish.len(), &publish))
            .await
            .unwrap();

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (5, MSG_COMMAND_AMF0));
        assert_eq!(
            amf0::decode_all(&msg.payload).unwrap(),
            vec![
                AmfValue::String("onStatus".into()),
                AmfValue::Number(5.0),
                AmfValue::Null,
                AmfValue::Object(AmfObject::from([
                    ("level", AmfValue::from("status")),
                    ("code", AmfValue::from("NetStream.Publish.Start")),
                    ("description", AmfValue::from("publish start")),
                ])),
            ]
        );

        mr
    }

    fn video_config_body() -> Vec<u8> {
        let record = crate::media::AvcConfig::from_parameter_sets(
            Bytes::copy_from_slice(&SPS),
            Bytes::copy_from_slice(&PPS),
        )
        .unwrap()
        .encode();
        let mut body = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(&record);
        body
    }

    fn assert_tracks_standard(video: Option<TrackH264>, audio: Option<TrackAac>) {
        let video = video.expect("video track");
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.sps, Bytes::copy_from_slice(&SPS));
        assert_eq!(video.pps, Bytes::copy_from_slice(&PPS));

        let audio = audio.expect("audio track");
        assert_eq!(audio.payload_type, 96);
        assert_eq!(audio.object_type, 2);
        assert_eq!(audio.sample_rate, 44100);
        assert_eq!(audio.channel_count, 2);
    }

    // === read_tracks scenarios ===

    #[tokio::test]
    async fn test_read_tracks_standard() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        let _mr = drive_to_publish(rd, &mut wr).await;

        // metadata with codec ids
        let metadata = amf0::encode_all(&[
            AmfValue::String("@setDataFrame".into()),
            AmfValue::String("onMetaData".into()),
            AmfValue::Object(AmfObject::from([
                ("videodatarate", AmfValue::from(0.0)),
                ("videocodecid", AmfValue::from(7.0)),
                ("audiodatarate", AmfValue::from(0.0)),
                ("audiocodecid", AmfValue::from(10.0)),
            ])),
        ]);
        wr.write_all(&chunk0(4, MSG_DATA_AMF0, 1, metadata.len(), &metadata))
            .await
            .unwrap();

        // H.264 decoder config
        let video = video_config_body();
        wr.write_all(&chunk0(6, MSG_VIDEO, 1, video.len(), &video))
            .await
            .unwrap();

        // AAC decoder config
        let audio = [0xAF, 0x00, 0x12, 0x10];
        wr.write_all(&chunk0(4, MSG_AUDIO, 1, audio.len(), &audio))
            .await
            .unwrap();

        let (video, audio) = handle.await.unwrap().unwrap();
        assert_tracks_standard(video, audio);
    }

    #[tokio::test]
    async fn test_read_tracks_metadata_without_codec_id() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        let _mr = drive_to_publish(rd, &mut wr).await;

        let metadata = amf0::encode_all(&[
            AmfValue::String("@setDataFrame".into()),
            AmfValue::String("onMetaData".into()),
            AmfValue::Object(AmfObject::from([
                ("width", AmfValue::from(2688.0)),
                ("height", AmfValue::from(1520.0)),
                ("framerate", AmfValue::from(21.0)),
            ])),
        ]);
        wr.write_all(&chunk0(4, MSG_DATA_AMF0, 1, metadata.len(), &metadata))
            .await
            .unwrap();

        let video = video_config_body();
        wr.write_all(&chunk0(6, MSG_VIDEO, 1, video.len(), &video))
            .await
            .unwrap();

        let (video, audio) = handle.await.unwrap().unwrap();
        assert!(video.is_some());
        assert_eq!(video.unwrap().sps, Bytes::copy_from_slice(&SPS));
        assert!(audio.is_none());
    }

    #[tokio::test]
    async fn test_read_tracks_no_metadata() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        let _mr = drive_to_publish(rd, &mut wr).await;

        let video = video_config_body();
        wr.write_all(&chunk0(6, MSG_VIDEO, 1, video.len(), &video))
            .await
            .unwrap();

        let (video, audio) = handle.await.unwrap().unwrap();
        assert!(video.is_some());
        assert!(audio.is_none());
    }

    #[tokio::test]
    async fn test_read_tracks_publish_ends_before_video_config() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        let mr = drive_to_publish(rd, &mut wr).await;

        // Close while the server is collecting tags
        drop(mr);
        drop(wr);

        match handle.await.unwrap() {
            Err(Error::Track(TrackError::MissingVideoConfig)) => {}
            other => panic!("expected MissingVideoConfig, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_tracks_rejects_play() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        send_connect(&mut wr).await;

        let mut mr = MessageReader::new(rd, None);
        expect_connect_replies(&mut mr).await;

        let create = amf0::encode_all(&[
            AmfValue::String("createStream".into()),
            AmfValue::Number(2.0),
            AmfValue::Null,
        ]);
        wr.write_all(&chunk1(3, MSG_COMMAND_AMF0, &create)).await.unwrap();
        let _result = mr.read_message().await.unwrap();

        let play = amf0::encode_all(&[
            AmfValue::String("play".into()),
            AmfValue::Number(3.0),
            AmfValue::Null,
            AmfValue::String("".into()),
            AmfValue::Number(-2000.0),
        ]);
        wr.write_all(&chunk0(8, MSG_COMMAND_AMF0, 1, play.len(), &play))
            .await
            .unwrap();

        match handle.await.unwrap() {
            Err(Error::UnexpectedCommand(name)) => assert_eq!(name, "play"),
            other => panic!("expected UnexpectedCommand, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_type3_without_precedent_fails_session() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;

        // Type-3 chunk with no prior chunk on csid 3
        wr.write_all(&chunk3(3, &[0x00, 0x01])).await.unwrap();

        match handle.await.unwrap() {
            Err(Error::Protocol(ProtocolError::NoPriorChunk(3))) => {}
            other => panic!("expected NoPriorChunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_timeout_surfaces() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let config = ConnConfig {
                read_timeout: Some(Duration::from_millis(100)),
                ..ConnConfig::default()
            };
            let mut conn = Conn::with_config(server, config);
            conn.server_handshake().await?;
            conn.read_tracks().await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        // Send nothing further; the server's read deadline expires

        match handle.await.unwrap() {
            Err(Error::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    // === write_tracks scenario ===

    #[tokio::test]
    async fn test_write_tracks() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;

            let video = TrackH264::new(
                Bytes::copy_from_slice(&SPS),
                Bytes::copy_from_slice(&PPS),
            )?;
            let audio = TrackAac::new(2, 44100, 2);
            conn.write_tracks(Some(&video), Some(&audio)).await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        send_connect(&mut wr).await;

        let mut mr = MessageReader::new(rd, None);
        expect_connect_replies(&mut mr).await;

        // C->S window acknowledgement size + set chunk size
        wr.write_all(&chunk0(2, MSG_WINDOW_ACK_SIZE, 0, 4, &[0x00, 0x26, 0x25, 0xA0]))
            .await
            .unwrap();
        wr.write_all(&chunk0(2, MSG_SET_CHUNK_SIZE, 0, 4, &[0x00, 0x01, 0x00, 0x00]))
            .await
            .unwrap();

        // createStream
        let create = amf0::encode_all(&[
            AmfValue::String("createStream".into()),
            AmfValue::Number(2.0),
            AmfValue::Null,
        ]);
        wr.write_all(&chunk1(3, MSG_COMMAND_AMF0, &create)).await.unwrap();

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (3, MSG_COMMAND_AMF0));
        assert_eq!(
            amf0::decode_all(&msg.payload).unwrap(),
            vec![
                AmfValue::String("_result".into()),
                AmfValue::Number(2.0),
                AmfValue::Null,
                AmfValue::Number(1.0),
            ]
        );

        // getStreamLength rides a type-0 message id, accepted silently
        let get_length = amf0::encode_all(&[
            AmfValue::String("getStreamLength".into()),
            AmfValue::Number(3.0),
            AmfValue::Null,
            AmfValue::String("".into()),
        ]);
        wr.write_all(&chunk0(8, 0, 0, get_length.len(), &get_length))
            .await
            .unwrap();

        // play
        let play = amf0::encode_all(&[
            AmfValue::String("play".into()),
            AmfValue::Number(4.0),
            AmfValue::Null,
            AmfValue::String("".into()),
            AmfValue::Number(-2000.0),
        ]);
        wr.write_all(&chunk0(8, MSG_COMMAND_AMF0, 0, play.len(), &play))
            .await
            .unwrap();

        // Stream Is Recorded, then Stream Begin
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id, msg.stream_id), (2, MSG_USER_CONTROL, 0));
        assert_eq!(&msg.payload[..], &[0x00, 0x04, 0x00, 0x00, 0x00, 0x01]);

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id, msg.stream_id), (2, MSG_USER_CONTROL, 0));
        assert_eq!(&msg.payload[..], &[0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);

        // onStatus burst
        for (code, description) in [
            ("NetStream.Play.Reset", "play reset"),
            ("NetStream.Play.Start", "play start"),
            ("NetStream.Data.Start", "data start"),
            ("NetStream.Play.PublishNotify", "publish notify"),
        ] {
            let msg = mr.read_message().await.unwrap();
            assert_eq!((msg.csid, msg.type_id), (5, MSG_COMMAND_AMF0));
            assert_eq!(
                amf0::decode_all(&msg.payload).unwrap(),
                vec![
                    AmfValue::String("onStatus".into()),
                    AmfValue::Number(4.0),
                    AmfValue::Null,
                    AmfValue::Object(AmfObject::from([
                        ("level", AmfValue::from("status")),
                        ("code", AmfValue::from(code)),
                        ("description", AmfValue::from(description)),
                    ])),
                ]
            );
        }

        // onMetaData
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (4, MSG_DATA_AMF0));
        assert_eq!(
            amf0::decode_all(&msg.payload).unwrap(),
            vec![
                AmfValue::String("onMetaData".into()),
                AmfValue::Object(AmfObject::from([
                    ("videodatarate", AmfValue::from(0.0)),
                    ("videocodecid", AmfValue::from(7.0)),
                    ("audiodatarate", AmfValue::from(0.0)),
                    ("audiocodecid", AmfValue::from(10.0)),
                ])),
            ]
        );

        // H.264 decoder config
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (6, MSG_VIDEO));
        assert_eq!(
            &msg.payload[..],
            &[
                0x17, 0x00, 0x00, 0x00, 0x00, 0x01, 0x64, 0x00, 0x0c, 0xff, 0xe1, 0x00, 0x15,
                0x67, 0x64, 0x00, 0x0c, 0xac, 0x3b, 0x50, 0xb0, 0x4b, 0x42, 0x00, 0x00, 0x03,
                0x00, 0x02, 0x00, 0x00, 0x03, 0x00, 0x3d, 0x08, 0x01, 0x00, 0x04, 0x68, 0xee,
                0x3c, 0x80,
            ][..]
        );

        // AAC decoder config
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (4, MSG_AUDIO));
        assert_eq!(&msg.payload[..], &[0xAE, 0x00, 0x12, 0x10]);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_tracks_video_only_omits_audio_keys() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            let video = TrackH264::new(
                Bytes::copy_from_slice(&SPS),
                Bytes::copy_from_slice(&PPS),
            )?;
            conn.write_tracks(Some(&video), None).await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        send_connect(&mut wr).await;

        let mut mr = MessageReader::new(rd, None);
        expect_connect_replies(&mut mr).await;

        let create = amf0::encode_all(&[
            AmfValue::String("createStream".into()),
            AmfValue::Number(2.0),
            AmfValue::Null,
        ]);
        wr.write_all(&chunk1(3, MSG_COMMAND_AMF0, &create)).await.unwrap();
        let _result = mr.read_message().await.unwrap();

        let play = amf0::encode_all(&[
            AmfValue::String("play".into()),
            AmfValue::Number(3.0),
            AmfValue::Null,
            AmfValue::String("".into()),
            AmfValue::Number(-2000.0),
        ]);
        wr.write_all(&chunk0(8, MSG_COMMAND_AMF0, 0, play.len(), &play))
            .await
            .unwrap();

        // Skip events and the status burst
        for _ in 0..6 {
            mr.read_message().await.unwrap();
        }

        let msg = mr.read_message().await.unwrap();
        assert_eq!(msg.type_id, MSG_DATA_AMF0);
        assert_eq!(
            amf0::decode_all(&msg.payload).unwrap(),
            vec![
                AmfValue::String("onMetaData".into()),
                AmfValue::Object(AmfObject::from([
                    ("videodatarate", AmfValue::from(0.0)),
                    ("videocodecid", AmfValue::from(7.0)),
                ])),
            ]
        );

        // Video config follows, and no audio config: the session is done
        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (6, MSG_VIDEO));

        handle.await.unwrap().unwrap();
    }

    // === media phase ===

    #[tokio::test]
    async fn test_media_roundtrip_after_tracks() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(async move {
            let mut conn = Conn::new(server);
            conn.server_handshake().await?;
            let (video, _audio) = conn.read_tracks().await?;
            assert!(video.is_some());

            // Post-track ingest hands out raw messages
            let msg = conn.read_message().await?;
            Ok::<_, Error>((msg, conn))
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        peer_handshake(&mut rd, &mut wr).await;
        let mut mr = drive_to_publish(rd, &mut wr).await;

        let video = video_config_body();
        wr.write_all(&chunk0(6, MSG_VIDEO, 1, video.len(), &video))
            .await
            .unwrap();

        // A media frame after track resolution
        let frame = [0x27, 0x01, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        wr.write_all(&chunk0(6, MSG_VIDEO, 1, frame.len(), &frame))
            .await
            .unwrap();

        let (msg, conn) = handle.await.unwrap().unwrap();
        assert_eq!(msg.type_id, MSG_VIDEO);
        assert_eq!(&msg.payload[..], &frame[..]);
        assert_eq!(conn.state(), SessionState::PublishReady);
        assert_eq!(conn.app(), "stream");

        // The split halves keep working independently
        let (_reader, mut writer) = conn.into_split();
        writer
            .write_message(&Message::new(
                CSID_VIDEO,
                MSG_VIDEO,
                1,
                0,
                Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]),
            ))
            .await
            .unwrap();

        let msg = mr.read_message().await.unwrap();
        assert_eq!((msg.csid, msg.type_id), (6, MSG_VIDEO));
        assert_eq!(&msg.payload[..], &[0x17, 0x01, 0x00, 0x00, 0x00]);
    }
}
