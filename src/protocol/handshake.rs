//! RTMP simple handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes) -------------->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes) ---------------|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! No HMAC digest: echo packets are produced but their content is not
//! validated on receipt, which every mainstream encoder accepts.
//!
//! Reference: RTMP Specification Section 5.2

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Run the server side of the handshake
pub async fn server_handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // C0
    let mut c0 = [0u8; 1];
    reader.read_exact(&mut c0).await?;
    if c0[0] != RTMP_VERSION {
        return Err(HandshakeError::BadVersion(c0[0]).into());
    }

    // C1
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut c1).await?;

    // S0 + S1 + S2
    writer.write_all(&[RTMP_VERSION]).await?;
    writer.write_all(&filler_packet()).await?;
    writer.write_all(&echo_packet(&c1)).await?;
    writer.flush().await?;

    // C2: content not validated
    let mut c2 = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut c2).await?;

    tracing::debug!("server handshake complete");
    Ok(())
}

/// Run the client side of the handshake
pub async fn client_handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // C0 + C1
    writer.write_all(&[RTMP_VERSION]).await?;
    writer.write_all(&filler_packet()).await?;
    writer.flush().await?;

    // S0
    let mut s0 = [0u8; 1];
    reader.read_exact(&mut s0).await?;
    if s0[0] != RTMP_VERSION {
        return Err(HandshakeError::BadVersion(s0[0]).into());
    }

    // S1 + S2: S2 content not validated
    let mut s1 = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut s1).await?;
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut s2).await?;

    // C2: echo S1
    writer.write_all(&echo_packet(&s1)).await?;
    writer.flush().await?;

    tracing::debug!("client handshake complete");
    Ok(())
}

/// Generate a C1/S1 packet
///
/// Bytes 0-3 carry a millisecond timestamp, bytes 4-7 are zero (simple
/// handshake), the rest is filler from a seeded LCG. The simple handshake
/// puts no requirement on the filler beyond being present.
fn filler_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    let mut seed = timestamp as u64 | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    packet
}

/// Generate a C2/S2 echo of the peer's packet, stamping bytes 4-7 with the
/// local receive time
fn echo_packet(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());

    echo
}
