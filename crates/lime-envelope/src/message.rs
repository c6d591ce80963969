use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{envelope_header_builders, EnvelopeHeader};

/// Media type of plain text content.
pub const TEXT_PLAIN: &str = "text/plain";

/// Application content exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub header: EnvelopeHeader,
    /// Media type of `content`.
    #[serde(rename = "type")]
    pub media_type: String,
    pub content: Value,
}

impl Message {
    pub fn new(media_type: impl Into<String>, content: Value) -> Self {
        Self {
            header: EnvelopeHeader::default(),
            media_type: media_type.into(),
            content,
        }
    }

    /// A `text/plain` message.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(TEXT_PLAIN, Value::String(content.into()))
    }
}

envelope_header_builders!(Message);
