use async_trait::async_trait;
use lime_envelope::{Envelope, SessionCompression, SessionEncryption};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;

/// Any duplex byte stream a transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased duplex stream, so an upgraded (e.g. TLS) stream can replace a plain one.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Wraps an established stream in an encryption layer.
///
/// Certificate and identity validation belong to the implementor.
#[async_trait]
pub trait StreamUpgrader: Send + Sync {
    /// Encryption modes this upgrader can apply.
    fn supported_encryption(&self) -> Vec<SessionEncryption>;

    /// Replace `stream` with one protected by `encryption`.
    async fn upgrade(
        &self,
        stream: BoxedStream,
        encryption: SessionEncryption,
    ) -> std::io::Result<BoxedStream>;
}

/// An openable, closable duplex stream of envelopes.
///
/// `send` and `receive` fail with [`TransportError::InvalidState`] before
/// `open` and after `close`. Envelopes are received in stream order.
///
/// [`TransportError::InvalidState`]: crate::TransportError::InvalidState
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the endpoint addressed by `uri`.
    async fn open(&self, uri: &Url, cancel: &CancellationToken) -> Result<()>;

    /// Close the stream. Closing an already closed transport is a no-op.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send one envelope.
    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()>;

    /// Receive the next envelope in stream order.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope>;

    fn is_connected(&self) -> bool;

    fn supported_compression(&self) -> Vec<SessionCompression>;

    fn compression(&self) -> SessionCompression;

    /// Switch the stream compression. Waits until no send or receive is in flight.
    async fn set_compression(
        &self,
        compression: SessionCompression,
        cancel: &CancellationToken,
    ) -> Result<()>;

    fn supported_encryption(&self) -> Vec<SessionEncryption>;

    fn encryption(&self) -> SessionEncryption;

    /// Switch the stream encryption. Waits until no send or receive is in flight.
    async fn set_encryption(
        &self,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
