use std::fmt;
use std::io;

use lime_channel::ChannelError;
use lime_frame::FrameError;
use lime_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => FAILURE,
        _ => TRANSPORT_ERROR,
    }
}

fn frame_code(err: &FrameError) -> i32 {
    match err {
        FrameError::Io(source) => io_code(source),
        FrameError::BufferOverflow { .. } | FrameError::EnvelopeTooLarge { .. } => DATA_INVALID,
        FrameError::ConnectionClosed => FAILURE,
    }
}

fn transport_code(err: &TransportError) -> i32 {
    match err {
        TransportError::Connect { source, .. }
        | TransportError::Bind { source, .. }
        | TransportError::Io(source) => io_code(source),
        TransportError::Frame(err) => frame_code(err),
        TransportError::Envelope(_) => DATA_INVALID,
        TransportError::InvalidUri(_) => USAGE,
        TransportError::Timeout(_) => TIMEOUT,
        TransportError::Closed => FAILURE,
        _ => TRANSPORT_ERROR,
    }
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    CliError::new(transport_code(&err), format!("{context}: {err}"))
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    let code = match &err {
        ChannelError::Transport(err) => transport_code(err),
        ChannelError::InvalidArgument(_) | ChannelError::InvalidOperation { .. } => USAGE,
        ChannelError::Timeout(_) => TIMEOUT,
        ChannelError::SessionFailed(_)
        | ChannelError::UnexpectedSessionState(_)
        | ChannelError::Closed => FAILURE,
        ChannelError::UnexpectedEnvelope(_) => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}
