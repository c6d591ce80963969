use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::command::Command;
use crate::error::{EnvelopeError, Result};
use crate::message::Message;
use crate::node::Node;
use crate::notification::Notification;
use crate::session::Session;

/// Fields shared by every envelope kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Request correlation token. Absent or empty for fire-and-forget envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    /// Node the sender acts on behalf of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EnvelopeHeader {
    /// The id, if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// The effective sender: `pp` when present, otherwise `from`.
    pub fn sender(&self) -> Option<&Node> {
        self.pp.as_ref().or(self.from.as_ref())
    }
}

/// Failure reason attached to notifications, commands and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{description} (code {})", self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// The closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    Notification,
    Command,
    Session,
}

impl EnvelopeKind {
    /// Detect the kind of a JSON object from its distinctive top-level field.
    pub fn detect(object: &Map<String, Value>) -> Option<Self> {
        if object.contains_key("content") {
            Some(Self::Message)
        } else if object.contains_key("event") {
            Some(Self::Notification)
        } else if object.contains_key("method") {
            Some(Self::Command)
        } else if object.contains_key("state") {
            Some(Self::Session)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notification => "notification",
            Self::Command => "command",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol unit exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Message(Message),
    Notification(Notification),
    Command(Command),
    Session(Session),
}

impl Envelope {
    /// Decode an envelope from a JSON document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Decode an envelope from an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .as_object()
            .and_then(EnvelopeKind::detect)
            .ok_or(EnvelopeError::UnknownKind)?;
        let envelope = match kind {
            EnvelopeKind::Message => Self::Message(serde_json::from_value(value)?),
            EnvelopeKind::Notification => Self::Notification(serde_json::from_value(value)?),
            EnvelopeKind::Command => Self::Command(serde_json::from_value(value)?),
            EnvelopeKind::Session => Self::Session(serde_json::from_value(value)?),
        };
        Ok(envelope)
    }

    /// Encode this envelope as a compact JSON document.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Message(_) => EnvelopeKind::Message,
            Self::Notification(_) => EnvelopeKind::Notification,
            Self::Command(_) => EnvelopeKind::Command,
            Self::Session(_) => EnvelopeKind::Session,
        }
    }

    pub fn header(&self) -> &EnvelopeHeader {
        match self {
            Self::Message(m) => &m.header,
            Self::Notification(n) => &n.header,
            Self::Command(c) => &c.header,
            Self::Session(s) => &s.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EnvelopeHeader {
        match self {
            Self::Message(m) => &mut m.header,
            Self::Notification(n) => &mut n.header,
            Self::Command(c) => &mut c.header,
            Self::Session(s) => &mut s.header,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.header().id()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

impl From<Message> for Envelope {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Notification> for Envelope {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

impl From<Command> for Envelope {
    fn from(value: Command) -> Self {
        Self::Command(value)
    }
}

impl From<Session> for Envelope {
    fn from(value: Session) -> Self {
        Self::Session(value)
    }
}

/// Fluent header setters shared by the four envelope structs.
macro_rules! envelope_header_builders {
    ($ty:ty) => {
        impl $ty {
            pub fn with_id(mut self, id: impl Into<String>) -> Self {
                self.header.id = Some(id.into());
                self
            }

            pub fn with_from(mut self, from: $crate::node::Node) -> Self {
                self.header.from = Some(from);
                self
            }

            pub fn with_to(mut self, to: $crate::node::Node) -> Self {
                self.header.to = Some(to);
                self
            }

            pub fn with_pp(mut self, pp: $crate::node::Node) -> Self {
                self.header.pp = Some(pp);
                self
            }

            pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
                self.header.metadata.insert(key.into(), value.into());
                self
            }

            /// The id, if present and non-empty.
            pub fn id(&self) -> Option<&str> {
                self.header.id()
            }
        }
    };
}

pub(crate) use envelope_header_builders;
