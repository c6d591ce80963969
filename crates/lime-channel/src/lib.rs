//! Lime sessions over a [`Transport`](lime_transport::Transport).
//!
//! - [`Channel`] enforces the session state machine for one transport and
//!   demultiplexes inbound envelopes by kind
//! - [`ChannelBuilder`] opens transports and wraps them in client channels;
//!   [`EstablishedChannelBuilder`] also runs the handshake
//! - [`OnDemandChannel`] keeps an established channel available, rebuilding
//!   it after failures as its observers allow
//!
//! Servers drive the handshake with [`establish_server_session`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lime_channel::{ChannelBuilder, OnDemandChannel};
//! use lime_envelope::Message;
//! use lime_transport::{TcpTransport, Transport};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn example() -> lime_channel::Result<()> {
//! let uri = Url::parse("net.tcp://localhost:55321").expect("valid uri");
//! let builder = ChannelBuilder::new(uri, || Arc::new(TcpTransport::new()) as Arc<dyn Transport>)
//!     .established()
//!     .with_identity("alice@example.org".parse().expect("valid identity"))
//!     .with_password("secret");
//! let channel = OnDemandChannel::new(builder);
//!
//! let cancel = CancellationToken::new();
//! channel.send_message(Message::text("hello"), &cancel).await?;
//! let reply = channel.receive_message(&cancel).await?;
//! println!("{}", reply.content);
//! channel.finish(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod channel;
pub mod client;
pub mod error;
pub mod established;
pub mod information;
pub mod module;
pub mod on_demand;
pub mod server;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{ChannelBuilder, ChannelHandler, TransportFactory};
pub use channel::{Channel, ChannelConfig, DEFAULT_ENVELOPE_BUFFER_SIZE, DEFAULT_SEND_TIMEOUT};
pub use error::{ChannelError, Result};
pub use established::{
    Authenticator, CompressionSelector, EncryptionSelector, EstablishChannel,
    EstablishedChannelBuilder,
};
pub use information::{ChannelInformation, FailedChannelInformation};
pub use module::ChannelModule;
pub use on_demand::{ChannelInformationHandler, FailedChannelHandler, OnDemandChannel};
pub use server::{
    establish_server_session, ServerAuthenticator, ServerSessionOptions,
    REASON_AUTHENTICATION_FAILED, REASON_INVALID_NEGOTIATION,
};
pub use state::ChannelRole;
