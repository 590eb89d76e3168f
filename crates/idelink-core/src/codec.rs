//! Length-prefixed JSON framing over the daemon's byte streams.
//!
//! Each frame is a 4-byte big-endian payload length followed by a JSON
//! document:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ payload: `len` bytes of JSON │
//! └──────────────┴──────────────────────────────┘
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const PREAMBLE_LEN: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// Errors from encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("end of stream")]
    EndOfStream,

    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

/// Serialize `value` into a complete frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(PREAMBLE_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Total length (preamble included) of the first frame in `buf`, or `None`
/// if `buf` does not yet hold a complete frame.
fn complete_frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let Some(preamble) = buf.get(..PREAMBLE_LEN) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; PREAMBLE_LEN];
    len_bytes.copy_from_slice(preamble);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    let total = PREAMBLE_LEN + len;
    Ok((buf.len() >= total).then_some(total))
}

/// Decode the first frame in `buf`. Returns the value and the number of
/// bytes it occupied, or `None` if more bytes are needed.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, CodecError> {
    match complete_frame_len(buf)? {
        Some(total) => {
            let value = serde_json::from_slice(&buf[PREAMBLE_LEN..total])?;
            Ok(Some((value, total)))
        }
        None => Ok(None),
    }
}

/// Writes frames to an async byte sink.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one framed value and flush. Returns the number of bytes
    /// written, preamble included.
    pub async fn write<T: Serialize>(&mut self, value: &T) -> Result<usize, CodecError> {
        let frame = encode_frame(value)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(frame.len())
    }
}

/// Reads frames from an async byte source.
///
/// Bytes read but not yet forming a complete frame are kept in an internal
/// buffer, so [`read`](Self::read) is cancel-safe: dropping an in-progress
/// read never loses data.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Read the next framed value.
    ///
    /// Returns [`CodecError::EndOfStream`] when the stream ends on a frame
    /// boundary and [`CodecError::Truncated`] when it ends mid-frame.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        loop {
            if let Some(total) = complete_frame_len(&self.buf)? {
                let frame: Vec<u8> = self.buf.drain(..total).collect();
                return Ok(serde_json::from_slice(&frame[PREAMBLE_LEN..])?);
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    CodecError::EndOfStream
                } else {
                    CodecError::Truncated {
                        buffered: self.buf.len(),
                    }
                });
            }
        }
    }
}
