//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian body length followed by that many bytes
//! of UTF-8 JSON.  Oversized frames are drained off the socket before the
//! error is reported so the connection stays aligned for the next frame.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {declared} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { declared: usize, max: usize },
    #[error("timed out after {0:?} waiting for the peer")]
    Timeout(Duration),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame body is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read-side bounds for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_bytes: usize,
    /// How long to wait for the first byte of a frame.
    pub idle_timeout: Duration,
    /// How long the rest of the frame may take once it has started.
    pub read_timeout: Duration,
}

fn eof_as_truncated(err: std::io::Error) -> WireError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Truncated
    } else {
        WireError::Io(err)
    }
}

/// Read one frame body.  Returns `Ok(None)` when the peer closed cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let first = timeout(limits.idle_timeout, reader.read(&mut prefix[..1]))
        .await
        .map_err(|_| WireError::Timeout(limits.idle_timeout))??;
    if first == 0 {
        return Ok(None);
    }
    timeout(limits.read_timeout, reader.read_exact(&mut prefix[1..]))
        .await
        .map_err(|_| WireError::Timeout(limits.read_timeout))?
        .map_err(eof_as_truncated)?;

    let declared = u32::from_be_bytes(prefix) as usize;
    if declared > limits.max_bytes {
        let mut limited = (&mut *reader).take(declared as u64);
        let drained = timeout(
            limits.read_timeout,
            tokio::io::copy(&mut limited, &mut tokio::io::sink()),
        )
        .await
        .map_err(|_| WireError::Timeout(limits.read_timeout))??;
        if drained < declared as u64 {
            return Err(WireError::Truncated);
        }
        return Err(WireError::PayloadTooLarge {
            declared,
            max: limits.max_bytes,
        });
    }

    let mut body = vec![0u8; declared];
    timeout(limits.read_timeout, reader.read_exact(&mut body))
        .await
        .map_err(|_| WireError::Timeout(limits.read_timeout))?
        .map_err(eof_as_truncated)?;
    Ok(Some(body))
}

pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(body.len()).map_err(|_| WireError::PayloadTooLarge {
        declared: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Serialize `message` and write it as one frame.  Returns the body size.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<usize, WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let frame = encode_frame(&body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(body.len())
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(body)?)
}
