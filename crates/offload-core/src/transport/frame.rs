//! Framing for the socket transport.
//!
//! A TCP connection carries two kinds of frames, both `[u32 BE: len][len bytes]`:
//! the subprotocol handshake (one short text frame each way) and then one
//! encoded envelope per frame. Handshake frames get a much smaller length
//! ceiling than envelopes.

use crate::config::ProtocolConfig;
use crate::{ProviderError, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame of at most `limit` bytes.
///
/// `None` means the peer closed the stream between frames. An oversized
/// length is rejected before anything is allocated for it.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > limit {
        return Err(ProviderError::MessageTooLarge { length: len, max: limit });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write `payload` as one frame, header and body in a single write.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(ProviderError::MessageTooLarge {
            length: payload.len(),
            max: ProtocolConfig::MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the peer's handshake frame as text, bounded by the handshake timeout.
pub async fn read_handshake<R>(reader: &mut R) -> Result<String>
where
    R: AsyncReadExt + Unpin,
{
    let frame = tokio::time::timeout(
        ProtocolConfig::HANDSHAKE_TIMEOUT,
        read_frame(reader, ProtocolConfig::MAX_HANDSHAKE_SIZE),
    )
    .await
    .map_err(|_| ProviderError::protocol("handshake timed out"))??
    .ok_or_else(|| ProviderError::TransportClosed {
        reason: "connection closed during handshake".to_string(),
    })?;
    Ok(String::from_utf8_lossy(&frame).trim().to_string())
}
