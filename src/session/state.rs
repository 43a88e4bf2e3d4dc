//! Session lifecycle states

/// Where a connection stands in the publish/play dialogue
///
/// ```text
/// AwaitHandshake -> AwaitConnect -> AwaitCreateStream -> AwaitPublishOrPlay
///                                      |                       |
///                                      v                       v
///                                 ReadingTracks -> PublishReady
///                                                  PlayReady
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Raw socket, handshake not yet run
    AwaitHandshake,
    /// Handshake done, waiting for `connect`
    AwaitConnect,
    /// `connect` replied, waiting for `createStream` (FC commands ignored)
    AwaitCreateStream,
    /// Stream created, waiting for `publish` or `play`
    AwaitPublishOrPlay,
    /// Publish accepted, collecting metadata and codec-config tags
    ReadingTracks,
    /// Tracks resolved, media ingest in progress
    PublishReady,
    /// Play dialogue finished, media egress in progress
    PlayReady,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether the command phase is over and media is flowing
    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::PublishReady | SessionState::PlayReady)
    }
}
