use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};

/// Default maximum of unframed bytes held while waiting for a document to close: 1 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Configuration for envelope framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum unframed bytes buffered before the stream is considered broken.
    pub max_buffer_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// Scanner state that survives between partial reads.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    depth: usize,
    in_string: bool,
    escaping: bool,
    /// Offset of the next unscanned byte in the buffer.
    scanned: usize,
}

/// Codec that splits a byte stream into complete JSON envelope documents.
///
/// Decoded items are the raw bytes of one document, from its opening `{` to
/// the matching `}`. Encoding writes a document as-is.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    state: ScanState,
    config: FrameConfig,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            state: ScanState::default(),
            config,
        }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// True while the scanner is inside an unfinished document.
    pub fn is_mid_document(&self) -> bool {
        self.state.depth > 0
    }

    fn skip_to_document_start(&mut self, src: &mut BytesMut) {
        let skip = src.iter().position(|b| *b == b'{').unwrap_or(src.len());
        if skip > 0 {
            trace!(skipped = skip, "discarding bytes outside of an envelope");
            src.advance(skip);
        }
        self.state.scanned = 0;
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if self.state.depth == 0 {
            self.skip_to_document_start(src);
        }

        let state = &mut self.state;
        while state.scanned < src.len() {
            let byte = src[state.scanned];
            state.scanned += 1;

            if state.in_string {
                if state.escaping {
                    state.escaping = false;
                } else if byte == b'\\' {
                    state.escaping = true;
                } else if byte == b'"' {
                    state.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => state.in_string = true,
                b'{' => state.depth += 1,
                b'}' => {
                    // The buffer always starts at a `{` while depth > 0.
                    state.depth -= 1;
                    if state.depth == 0 {
                        let len = state.scanned;
                        state.scanned = 0;
                        return Ok(Some(src.split_to(len).freeze()));
                    }
                }
                _ => {}
            }
        }

        if src.len() > self.config.max_buffer_size {
            return Err(FrameError::BufferOverflow {
                size: src.len(),
                max: self.config.max_buffer_size,
            });
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.config.max_buffer_size {
            return Err(FrameError::EnvelopeTooLarge {
                size: item.len(),
                max: self.config.max_buffer_size,
            });
        }
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut EnvelopeCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_single_document() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"id":"1","state":"new"}"#[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), br#"{"id":"1","state":"new"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_concatenated_documents() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"a":1}{"b":{"c":2}}{"d":3}"#[..]);
        let frames = decode_all(&mut codec, &mut buf);
        let frames: Vec<&[u8]> = frames.iter().map(|f| f.as_ref()).collect();
        assert_eq!(
            frames,
            vec![&br#"{"a":1}"#[..], br#"{"b":{"c":2}}"#, br#"{"d":3}"#]
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let mut codec = EnvelopeCodec::new();
        let doc = br#"{"content":"} { }} {{","type":"text/plain"}"#;
        let mut buf = BytesMut::from(&doc[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), doc);
    }

    #[test]
    fn escaped_quotes_do_not_close_strings() {
        let mut codec = EnvelopeCodec::new();
        let doc = br#"{"content":"say \"}\" twice \\","x":"{"}"#;
        let mut buf = BytesMut::from(&doc[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), doc);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b" \r\n\"junk\" }{\"ok\":true}  "[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), br#"{"ok":true}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_document_waits_for_more_bytes() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"content":"hal"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.is_mid_document());

        buf.extend_from_slice(br#"f}"}"#);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ref(), br#"{"content":"half}"}"#);
        assert!(!codec.is_mid_document());
    }

    #[test]
    fn overflow_without_completed_document() {
        let mut codec = EnvelopeCodec::with_config(FrameConfig {
            max_buffer_size: 16,
        });
        let mut buf = BytesMut::from(&br#"{"content":"0123456789abcdef"#[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::BufferOverflow { max: 16, .. }
        ));
    }

    #[test]
    fn skipped_garbage_does_not_count_towards_overflow() {
        let mut codec = EnvelopeCodec::with_config(FrameConfig { max_buffer_size: 8 });
        let mut buf = BytesMut::from(&b"                              {}"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"{}");
    }

    #[test]
    fn eof_mid_document_is_connection_closed() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"state":"#[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));

        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"  \n"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoder_writes_documents_verbatim() {
        let mut codec = EnvelopeCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(br#"{"a":1}"#), &mut dst)
            .unwrap();
        codec
            .encode(Bytes::from_static(br#"{"b":2}"#), &mut dst)
            .unwrap();
        assert_eq!(dst.as_ref(), br#"{"a":1}{"b":2}"#);
    }

    #[test]
    fn encoder_rejects_oversized_documents() {
        let mut codec = EnvelopeCodec::with_config(FrameConfig { max_buffer_size: 4 });
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(br#"{"a":1}"#), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::EnvelopeTooLarge { size: 7, max: 4 }));
    }

    #[tokio::test]
    async fn framed_read_over_duplex_stream() {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;
        use tokio_util::codec::FramedRead;

        let (mut client, server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            client
                .write_all(br#"{"id":"1","event":"received"}{"id":"2","content":"{x}"}"#)
                .await
                .unwrap();
        });

        let mut framed = FramedRead::new(server, EnvelopeCodec::new());
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first.as_ref(), br#"{"id":"1","event":"received"}"#);
        assert_eq!(second.as_ref(), br#"{"id":"2","content":"{x}"}"#);
        assert!(framed.next().await.is_none());
    }
}
