//! Self-delimited JSON envelope framing.
//!
//! Envelopes travel as JSON objects concatenated directly on the stream, with
//! no length prefix or separator. Boundaries are found by balancing `{` and `}`
//! while honoring string quoting and escapes:
//! - braces inside quoted strings are not counted
//! - a `"` preceded by an unescaped `\` does not end a string
//! - bytes before the first `{` of a document are skipped
//!
//! The scanner keeps its state between reads, so a document may arrive split
//! across any number of partial reads.

pub mod codec;
pub mod error;
pub mod framer;

pub use codec::{EnvelopeCodec, FrameConfig, DEFAULT_MAX_BUFFER_SIZE};
pub use error::{FrameError, Result};
pub use framer::EnvelopeFramer;
