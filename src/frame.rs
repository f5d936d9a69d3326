//! Framing of the inter-process transport.
//!
//! ```text
//! +------------------+---------------------------+------------------+
//! | Prefix (4 bytes) | Length (4 bytes, u32 LE)  | Payload          |
//! +------------------+---------------------------+------------------+
//! ```
//!
//! The prefix is opaque to the proxy and is only reported, hex-encoded, next
//! to the decoded payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::classify::{BinaryEncoding, Body, classify_payload, to_hex};

pub const HEADER_LEN: usize = 8;

/// Most a partial frame grows the buffer by ahead of its bytes arriving.
const RESERVE_LIMIT: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame declares {declared} payload bytes, limit is {max}")]
    TooLarge { declared: usize, max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: [u8; HEADER_LEN],
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(prefix: [u8; 4], payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&prefix);
        header[4..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        Self { header, payload }
    }

    #[must_use]
    pub fn header_hex(&self) -> String {
        to_hex(&self.header)
    }

    #[must_use]
    pub fn body(&self, encoding: BinaryEncoding) -> Body {
        classify_payload(&self.payload, encoding)
    }
}

/// One frame rendered for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header_hex: String,
    pub body: Body,
}

/// Length-prefixed frame codec.
///
/// Incomplete headers or bodies stay buffered until the rest arrives.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    #[must_use]
    pub const fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(u32::MAX as usize)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if declared > self.max_len {
            return Err(FrameError::TooLarge {
                declared,
                max: self.max_len,
            });
        }
        if src.len() < HEADER_LEN + declared {
            // The header alone is not trusted with a large allocation.
            src.reserve((HEADER_LEN + declared - src.len()).min(RESERVE_LIMIT));
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        src.copy_to_slice(&mut header);
        let payload = src.split_to(declared).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.max_len {
            return Err(FrameError::TooLarge {
                declared: frame.payload.len(),
                max: self.max_len,
            });
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_slice(&frame.header[..4]);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Incremental decoder for one direction of an IPC connection.
///
/// Chunks are fed as they are relayed; frames are yielded once complete.
#[derive(Debug)]
pub struct FrameStream {
    codec: FrameCodec,
    buffer: BytesMut,
    encoding: BinaryEncoding,
}

impl FrameStream {
    #[must_use]
    pub fn new(max_len: usize, encoding: BinaryEncoding) -> Self {
        Self {
            codec: FrameCodec::new(max_len),
            buffer: BytesMut::new(),
            encoding,
        }
    }

    /// Appends `chunk` and returns every frame it completed.
    ///
    /// A frame over the size limit drops everything buffered so far; later
    /// chunks are decoded as if they started a new frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DecodedFrame>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => frames.push(DecodedFrame {
                    header_hex: frame.header_hex(),
                    body: frame.body(self.encoding),
                }),
                Ok(None) => return Ok(frames),
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decodes every complete frame in `buffer`, in order.
///
/// A trailing partial frame is ignored.
#[must_use]
pub fn decode_frames(buffer: &[u8], encoding: BinaryEncoding) -> Vec<DecodedFrame> {
    let mut stream = FrameStream::new(u32::MAX as usize, encoding);
    stream.push(buffer).unwrap_or_default()
}
