/// Errors that can occur while building or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A node address could not be parsed.
    #[error("invalid node address '{0}'")]
    InvalidNode(String),

    /// The JSON document does not match any envelope kind.
    #[error("unknown envelope kind (expected one of content, event, method or state)")]
    UnknownKind,

    /// The authentication payload does not match its declared scheme.
    #[error("invalid authentication: {0}")]
    InvalidAuthentication(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
