//! Length-prefixed framing for transport streams
//!
//! Every frame is a 4-byte little-endian length header followed by the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Result, TransportError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest payload accepted in a single frame
pub const MAX_PAYLOAD: usize = 2_000_000;

/// Size of the length header
pub const LENGTH_HEADER: usize = 4;

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// Read one frame, rejecting payloads above `MAX_PAYLOAD`
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; LENGTH_HEADER];
    reader
        .read_exact(&mut header)
        .await
        .map_err(TransportError::from)?;

    let length = u32::from_le_bytes(header) as usize;
    if length > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            length,
            max: MAX_PAYLOAD,
        }
        .into());
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(TransportError::from)?;
    Ok(payload)
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            length: payload.len(),
            max: MAX_PAYLOAD,
        }
        .into());
    }

    let header = (payload.len() as u32).to_le_bytes();
    writer.write_all(&header).await.map_err(TransportError::from)?;
    writer.write_all(payload).await.map_err(TransportError::from)?;
    writer.flush().await.map_err(TransportError::from)?;
    Ok(())
}
