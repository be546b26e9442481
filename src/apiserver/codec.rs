//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian body length followed by a JSON body.
//! Frames larger than the configured maximum are rejected without buffering
//! the body.

use crate::core::error::{KeelError, KeelResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame body size (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded and consumed.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The input is invalid.
    Invalid(String),
}

/// Result of encoding a frame.
#[derive(Debug)]
pub enum EncodeResult {
    Ok(Bytes),
    Error(String),
}

/// Frame codec shared by the server and the client.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Attempt to decode one frame from the front of `buffer`.
    pub fn decode<T: DeserializeOwned>(&self, buffer: &mut BytesMut) -> DecodeResult<T> {
        if buffer.len() < HEADER_LEN {
            return DecodeResult::Incomplete;
        }
        let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if len > self.max_frame_bytes {
            return DecodeResult::Invalid(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_bytes
            ));
        }
        if buffer.len() < HEADER_LEN + len {
            buffer.reserve(HEADER_LEN + len - buffer.len());
            return DecodeResult::Incomplete;
        }
        buffer.advance(HEADER_LEN);
        let body = buffer.split_to(len);
        match serde_json::from_slice(&body) {
            Ok(frame) => DecodeResult::Complete(frame),
            Err(e) => DecodeResult::Invalid(format!("malformed frame: {}", e)),
        }
    }

    /// Encode one frame.
    pub fn encode<T: Serialize>(&self, frame: &T) -> EncodeResult {
        let body = match serde_json::to_vec(frame) {
            Ok(body) => body,
            Err(e) => return EncodeResult::Error(format!("cannot encode frame: {}", e)),
        };
        if body.len() > self.max_frame_bytes {
            return EncodeResult::Error(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                body.len(),
                self.max_frame_bytes
            ));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        EncodeResult::Ok(out.freeze())
    }

    /// Read the next frame. Returns `None` on a clean end of stream.
    ///
    /// Cancel safe: bytes already read stay in `buffer`.
    pub async fn read_frame<R, T>(&self, reader: &mut R, buffer: &mut BytesMut) -> KeelResult<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        loop {
            match self.decode(buffer) {
                DecodeResult::Complete(frame) => return Ok(Some(frame)),
                DecodeResult::Invalid(message) => return Err(KeelError::transport(message)),
                DecodeResult::Incomplete => {}
            }
            let n = reader
                .read_buf(buffer)
                .await
                .map_err(|e| KeelError::transport(format!("read error: {}", e)))?;
            if n == 0 {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(KeelError::transport("connection closed mid-frame"));
            }
        }
    }

    /// Encode and write one frame.
    pub async fn write_frame<W, T>(&self, writer: &mut W, frame: &T) -> KeelResult<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let bytes = match self.encode(frame) {
            EncodeResult::Ok(bytes) => bytes,
            EncodeResult::Error(message) => return Err(KeelError::internal(message)),
        };
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| KeelError::transport(format!("write error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| KeelError::transport(format!("write error: {}", e)))
    }
}
