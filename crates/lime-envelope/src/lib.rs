//! Envelope data model for the Lime protocol.
//!
//! Peers exchange four kinds of envelopes over a duplex stream:
//! - [`Message`] carries application content
//! - [`Notification`] reports the delivery lifecycle of a message
//! - [`Command`] manipulates a resource on the remote node
//! - [`Session`] negotiates and carries the connection lifecycle
//!
//! Every envelope shares the same header (`id`, `from`, `to`, `pp`, `metadata`).
//! The kind of a JSON document is derived from its distinctive top-level field.

pub mod authentication;
pub mod command;
pub mod envelope;
pub mod error;
pub mod message;
pub mod node;
pub mod notification;
pub mod session;

pub use authentication::{Authentication, AuthenticationScheme};
pub use command::{Command, CommandMethod, CommandStatus, PING_MEDIA_TYPE, PING_URI};
pub use envelope::{Envelope, EnvelopeHeader, EnvelopeKind, Reason};
pub use error::{EnvelopeError, Result};
pub use message::{Message, TEXT_PLAIN};
pub use node::{Identity, Node};
pub use notification::{Event, Notification};
pub use session::{Session, SessionCompression, SessionEncryption, SessionState};
