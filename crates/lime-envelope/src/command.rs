use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{envelope_header_builders, EnvelopeHeader, Reason};

/// Resource path of the ping request.
pub const PING_URI: &str = "/ping";
/// Media type of the ping response resource.
pub const PING_MEDIA_TYPE: &str = "application/vnd.lime.ping+json";

/// Action applied to a command resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMethod {
    Get,
    Set,
    Delete,
    Observe,
    Subscribe,
    Unsubscribe,
    Merge,
}

/// Processing status of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Pending,
    Success,
    Failure,
}

impl CommandStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Request or response about a resource on the remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub header: EnvelopeHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Media type of `resource`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    pub method: CommandMethod,
    #[serde(default, skip_serializing_if = "CommandStatus::is_pending")]
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Command {
    /// A pending request.
    pub fn new(method: CommandMethod, uri: impl Into<String>) -> Self {
        Self {
            header: EnvelopeHeader::default(),
            uri: Some(uri.into()),
            media_type: None,
            resource: None,
            method,
            status: CommandStatus::Pending,
            reason: None,
        }
    }

    /// Attach a typed resource document.
    pub fn with_resource(mut self, media_type: impl Into<String>, resource: Value) -> Self {
        self.media_type = Some(media_type.into());
        self.resource = Some(resource);
        self
    }

    /// A ping request.
    pub fn ping(id: impl Into<String>) -> Self {
        Self::new(CommandMethod::Get, PING_URI).with_id(id)
    }

    /// True for a pending `get /ping` request.
    pub fn is_ping_request(&self) -> bool {
        self.method == CommandMethod::Get
            && self.status.is_pending()
            && self
                .uri
                .as_deref()
                .is_some_and(|uri| uri.trim_end_matches('/').ends_with(PING_URI))
    }

    /// Build the success response to this ping request, addressed to its sender.
    pub fn ping_response(&self) -> Self {
        Self {
            header: EnvelopeHeader {
                id: self.header.id.clone(),
                to: self.header.sender().cloned(),
                ..EnvelopeHeader::default()
            },
            uri: None,
            media_type: Some(PING_MEDIA_TYPE.to_string()),
            resource: Some(json!({})),
            method: self.method,
            status: CommandStatus::Success,
            reason: None,
        }
    }

    /// Build a success response to this request.
    pub fn success_response(&self) -> Self {
        Self {
            header: EnvelopeHeader {
                id: self.header.id.clone(),
                to: self.header.sender().cloned(),
                ..EnvelopeHeader::default()
            },
            uri: None,
            media_type: None,
            resource: None,
            method: self.method,
            status: CommandStatus::Success,
            reason: None,
        }
    }

    /// Build a failure response to this request.
    pub fn failure_response(&self, reason: Reason) -> Self {
        Self {
            status: CommandStatus::Failure,
            reason: Some(reason),
            ..self.success_response()
        }
    }
}

envelope_header_builders!(Command);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn pending_status_is_omitted() {
        let value = serde_json::to_value(Command::ping("c1")).unwrap();
        assert_eq!(value, json!({ "id": "c1", "uri": "/ping", "method": "get" }));
    }

    #[test]
    fn ping_detection() {
        assert!(Command::ping("c1").is_ping_request());
        let lime_uri = Command::new(CommandMethod::Get, "lime://example.org/ping");
        assert!(lime_uri.is_ping_request());
        assert!(!Command::new(CommandMethod::Set, PING_URI).is_ping_request());
        assert!(!Command::new(CommandMethod::Get, "/presence").is_ping_request());
        assert!(!Command::ping("c1").success_response().is_ping_request());
    }

    #[test]
    fn ping_response_is_addressed_to_sender() {
        let request = Command::ping("c9").with_from(Node::new("alice", "example.org", "home"));
        let response = request.ping_response();
        assert_eq!(response.id(), Some("c9"));
        assert_eq!(response.status, CommandStatus::Success);
        assert_eq!(response.media_type.as_deref(), Some(PING_MEDIA_TYPE));
        assert_eq!(
            response.header.to.map(|node| node.to_string()).as_deref(),
            Some("alice@example.org/home")
        );
    }

    #[test]
    fn failure_response_carries_reason() {
        let request = Command::new(CommandMethod::Delete, "/contacts/1").with_id("d1");
        let response = request.failure_response(Reason::new(67, "not found"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["reason"]["code"], 67);
        assert_eq!(value["method"], "delete");
    }
}
