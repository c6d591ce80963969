/// Errors that can occur while framing envelopes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Unframed bytes exceeded the configured maximum before a document completed.
    #[error("buffer overflow ({size} unframed bytes, max {max})")]
    BufferOverflow { size: usize, max: usize },

    /// An outgoing envelope is larger than the peer is allowed to buffer.
    #[error("envelope too large ({size} bytes, max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing envelopes.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete envelope was received.
    #[error("connection closed (incomplete envelope)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
