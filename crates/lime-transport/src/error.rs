use std::time::Duration;

/// Errors that can occur in envelope transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {uri}: {source}")]
    Connect {
        uri: String,
        source: std::io::Error,
    },

    /// Failed to bind a listening endpoint.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// The URI cannot address this transport.
    #[error("invalid transport uri '{0}'")]
    InvalidUri(String),

    /// The operation is not valid in the current transport state.
    #[error("invalid transport state: {0}")]
    InvalidState(&'static str),

    /// The requested mode is not offered by this transport.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] lime_frame::FrameError),

    /// A framed document is not a valid envelope.
    #[error("envelope error: {0}")]
    Envelope(#[from] lime_envelope::EnvelopeError),

    /// Connecting took longer than the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The stream was closed, locally or by the remote peer.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
