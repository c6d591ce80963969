use lime_envelope::{Node, SessionState};

use crate::error::ChannelError;

/// Snapshot of a channel handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInformation {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub local_node: Option<Node>,
    pub remote_node: Option<Node>,
    /// Whether the transport was connected when the snapshot was taken.
    pub is_connected: bool,
}

impl ChannelInformation {
    /// Information for a channel that was never created.
    pub fn unavailable() -> Self {
        Self {
            session_id: None,
            state: SessionState::New,
            local_node: None,
            remote_node: None,
            is_connected: false,
        }
    }
}

/// A failed build or operation, handed to failure observers.
#[derive(Debug, Clone)]
pub struct FailedChannelInformation {
    pub information: ChannelInformation,
    pub error: ChannelError,
    /// Name of the failed operation, e.g. `SendMessage`.
    pub operation_name: &'static str,
}

impl FailedChannelInformation {
    pub fn new(
        information: ChannelInformation,
        error: ChannelError,
        operation_name: &'static str,
    ) -> Self {
        Self {
            information,
            error,
            operation_name,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.information.is_connected
    }
}
