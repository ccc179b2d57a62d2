//! Length-prefixed JSON framing for the daemon socket.
//!
//! A frame is a 4-byte big-endian length header followed by exactly that many
//! bytes of JSON:
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 BE length  | JSON payload (length B)   |
//! +----------------+---------------------------+
//! ```
//!
//! Payloads above [`MAX_FRAME_LEN`] are rejected at encode time, before any
//! byte is written, and at decode time, before the body is allocated.
//! Frames are always encoded completely in memory and written with a single
//! `write_all`, so a failed encode never leaves a half-written frame behind.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling for a single frame payload (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_LEN`].
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    /// Stream or buffer ended inside a frame.
    #[error("frame truncated: expected {expected} more bytes")]
    Truncated { expected: usize },

    /// Buffer length disagrees with the length header.
    #[error("frame length mismatch: header declares {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload is not valid JSON for the expected type.
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encode a message into a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] when the serialized payload exceeds
/// [`MAX_FRAME_LEN`], or [`FrameError::Json`] if serialization fails.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one complete frame held in `bytes`.
///
/// The buffer must contain exactly one frame: trailing or missing payload
/// bytes are an error.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN - bytes.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let declared = u32::from_be_bytes(header) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: declared,
            max: MAX_FRAME_LEN,
        });
    }

    let body = &bytes[HEADER_LEN..];
    if body.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    Ok(serde_json::from_slice(body)?)
}

/// Encode `msg` and write it to `writer`, then flush.
///
/// Nothing is written when encoding fails.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let buf = encode_frame(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame from `reader`, returning `None` on a clean EOF at a
/// frame boundary.
///
/// # Errors
///
/// EOF inside a header or body is [`FrameError::Truncated`]; an advertised
/// length above [`MAX_FRAME_LEN`] is [`FrameError::TooLarge`] and nothing of
/// the body is read.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: HEADER_LEN - filled,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut body).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Truncated { expected: len });
        }
        return Err(e.into());
    }

    Ok(Some(serde_json::from_slice(&body)?))
}
