use serde::{Deserialize, Serialize};

use crate::envelope::{envelope_header_builders, EnvelopeHeader, Reason};

/// Delivery lifecycle event of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Failed,
    Accepted,
    Validated,
    Authorized,
    Dispatched,
    Received,
    Consumed,
}

/// Information about the processing of a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub header: EnvelopeHeader,
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Notification {
    pub fn new(event: Event) -> Self {
        Self {
            header: EnvelopeHeader::default(),
            event,
            reason: None,
        }
    }

    /// A `failed` notification carrying its reason.
    pub fn failed(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(Event::Failed)
        }
    }
}

envelope_header_builders!(Notification);
