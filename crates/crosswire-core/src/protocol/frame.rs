//! Stream framing: 4-byte little-endian length prefix + envelope bytes.
//!
//! The length prefix is validated against [`MAX_FRAME_BYTES`] *before* any
//! body allocation or read, so a malicious or corrupt prefix cannot make the
//! process allocate gigabytes. End-of-stream exactly at a frame boundary is
//! reported as [`Error::PeerClosed`]; end-of-stream anywhere inside a frame is
//! [`Error::Truncated`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Hard cap on a single frame's payload: 8 MiB.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Read one frame payload from the stream.
pub async fn read_frame<R>(r: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    // Read the prefix byte-wise so a clean close (zero bytes read) can be
    // told apart from a close mid-prefix.
    let mut prefix = [0u8; 4];
    let mut filled = 0usize;
    while filled < prefix.len() {
        let n = r.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Err(Error::PeerClosed)
            } else {
                Err(Error::Truncated("length prefix"))
            };
        }
        filled += n;
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameOversize {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Truncated("frame body")
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Bytes::from(body))
}

/// Write one frame (prefix + payload) and flush.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Prefix a payload into a ready-to-write frame. Used to pre-encode outbound
/// frames before they enter a connection's bounded queue.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameOversize {
            len: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(Bytes::from(out))
}
