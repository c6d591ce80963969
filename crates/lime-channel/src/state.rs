//! Which envelopes each side may send in each session state.

use lime_envelope::{Envelope, SessionState};

use crate::error::{ChannelError, Result};

/// The side of the session a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Opens the session and authenticates.
    Client,
    /// Offers negotiation options and accepts the session.
    Server,
}

/// Check that `envelope` may be sent while the session is in `state`.
pub(crate) fn check_send(role: ChannelRole, state: SessionState, envelope: &Envelope) -> Result<()> {
    let (operation, allowed, expected) = match envelope {
        Envelope::Message(_) => (
            "send a message",
            state == SessionState::Established,
            Some(SessionState::Established),
        ),
        Envelope::Notification(_) => (
            "send a notification",
            state == SessionState::Established,
            Some(SessionState::Established),
        ),
        Envelope::Command(_) => (
            "send a command",
            state == SessionState::Established,
            Some(SessionState::Established),
        ),
        Envelope::Session(session) => {
            let (allowed, expected) = match role {
                ChannelRole::Client => client_session(state, session.state),
                ChannelRole::Server => server_session(state, session.state),
            };
            (session_operation(session.state), allowed, expected)
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(ChannelError::InvalidOperation {
            operation,
            state,
            expected,
        })
    }
}

fn client_session(current: SessionState, sending: SessionState) -> (bool, Option<SessionState>) {
    use SessionState::*;

    match sending {
        New | Negotiating | Authenticating => (current == sending, Some(sending)),
        Finishing => (current == Established, Some(Established)),
        Established | Finished | Failed => (false, None),
    }
}

fn server_session(current: SessionState, sending: SessionState) -> (bool, Option<SessionState>) {
    use SessionState::*;

    match sending {
        Negotiating => (matches!(current, New | Negotiating), Some(Negotiating)),
        Authenticating => (
            matches!(current, New | Negotiating | Authenticating),
            Some(Authenticating),
        ),
        Established => (current == Authenticating, Some(Authenticating)),
        Finished => (matches!(current, Established | Finishing), Some(Finishing)),
        Failed => (!current.is_terminal(), None),
        New | Finishing => (false, None),
    }
}

fn session_operation(sending: SessionState) -> &'static str {
    match sending {
        SessionState::New => "send a new session",
        SessionState::Negotiating => "send a negotiating session",
        SessionState::Authenticating => "send an authenticating session",
        SessionState::Established => "send an established session",
        SessionState::Finishing => "send a finishing session",
        SessionState::Finished => "send a finished session",
        SessionState::Failed => "send a failed session",
    }
}

/// Check that an envelope of a non-session kind may be received.
pub(crate) fn check_receive(operation: &'static str, state: SessionState) -> Result<()> {
    if state == SessionState::Established {
        Ok(())
    } else {
        Err(ChannelError::InvalidOperation {
            operation,
            state,
            expected: Some(SessionState::Established),
        })
    }
}
