use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lime_envelope::{EnvelopeKind, Reason, SessionState};
use lime_transport::TransportError;

/// Errors that can occur in channel operations.
///
/// Cloneable so the same failure can be handed to observers and returned to
/// the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),

    /// The operation is not allowed in the current session state.
    #[error("cannot {operation} while the session is {state}{}", expected_hint(.expected))]
    InvalidOperation {
        operation: &'static str,
        state: SessionState,
        expected: Option<SessionState>,
    },

    /// A caller-supplied value was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote peer failed the session.
    #[error("session failed{}", reason_hint(.0))]
    SessionFailed(Option<Reason>),

    /// The remote peer moved the session to a state this side did not expect.
    #[error("unexpected session state '{0}'")]
    UnexpectedSessionState(SessionState),

    /// An envelope of the wrong kind arrived while a session was expected.
    #[error("unexpected {} envelope received", kind_name(.0))]
    UnexpectedEnvelope(EnvelopeKind),

    /// A send did not complete within the configured timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The owner has been disposed.
    #[error("channel has been disposed")]
    Disposed,

    /// The channel stopped receiving; no more envelopes will arrive.
    #[error("channel closed")]
    Closed,

    /// Several callbacks failed.
    #[error("{} errors occurred: {}", error_count(.0), join_errors(.0))]
    Aggregate(Vec<ChannelError>),

    /// A caller-registered callback failed.
    #[error("handler failed: {0}")]
    Hook(String),
}

impl ChannelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors caused by the caller rather than the connection.
    ///
    /// These are never retried and never reported to failure observers.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOperation { .. } | Self::InvalidArgument(_) | Self::Disposed
        )
    }

    /// Collapse `errors` into one error, or `None` if empty.
    pub fn aggregate(mut errors: Vec<ChannelError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => Self::Cancelled,
            other => Self::Transport(Arc::new(other)),
        }
    }
}

fn expected_hint(expected: &Option<SessionState>) -> String {
    match expected {
        Some(state) => format!(" (expected {state})"),
        None => String::new(),
    }
}

fn reason_hint(reason: &Option<Reason>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

fn kind_name(kind: &EnvelopeKind) -> &'static str {
    kind.name()
}

fn error_count(errors: &[ChannelError]) -> usize {
    errors.len()
}

fn join_errors(errors: &[ChannelError]) -> String {
    struct Joined<'a>(&'a [ChannelError]);

    impl fmt::Display for Joined<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (i, err) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str("; ")?;
                }
                write!(f, "{err}")?;
            }
            Ok(())
        }
    }

    Joined(errors).to_string()
}

pub type Result<T> = std::result::Result<T, ChannelError>;
