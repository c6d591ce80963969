use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::codec::{EnvelopeCodec, FrameConfig};
use crate::error::Result;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Push-style envelope extractor.
///
/// Accumulates fed bytes and returns every document completed so far. Partial
/// documents are kept for the next call.
#[derive(Debug)]
pub struct EnvelopeFramer {
    codec: EnvelopeCodec,
    buf: BytesMut,
}

impl EnvelopeFramer {
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            codec: EnvelopeCodec::with_config(config),
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append `bytes` and extract the documents they complete, in stream order.
    ///
    /// A `BufferOverflow` error is fatal: the stream can no longer be framed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held while waiting for the current document to close.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for EnvelopeFramer {
    fn default() -> Self {
        Self::new()
    }
}
