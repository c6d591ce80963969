use std::sync::Arc;

use async_trait::async_trait;
use lime_envelope::{Envelope, SessionCompression, SessionEncryption};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, TransportError};
use crate::stream::{StreamTransport, TransportConfig};
use crate::traits::{StreamUpgrader, Transport};

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// In-process transport backed by `tokio::io::duplex`.
///
/// Each end of a pair stays disconnected until `open` (or `connect`) attaches
/// its half of the duplex. A closed end cannot be reopened.
pub struct MemoryTransport {
    inner: StreamTransport,
    pending: std::sync::Mutex<Option<tokio::io::DuplexStream>>,
}

impl MemoryTransport {
    /// Create two transports wired to each other.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_config(TransportConfig::default())
    }

    pub fn pair_with_config(config: TransportConfig) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        (
            Self::from_duplex(left, config.clone()),
            Self::from_duplex(right, config),
        )
    }

    fn from_duplex(stream: tokio::io::DuplexStream, config: TransportConfig) -> Self {
        Self {
            inner: StreamTransport::new("memory", config),
            pending: std::sync::Mutex::new(Some(stream)),
        }
    }

    /// Enable encryption modes offered by `upgrader`.
    pub fn with_upgrader(mut self, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        self.inner.set_upgrader(upgrader);
        self
    }

    /// Attach the in-process stream without going through `open`.
    pub async fn connect(&self) -> Result<()> {
        let stream = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match stream {
            Some(stream) => self.inner.attach(Box::new(stream)).await,
            None if self.inner.is_connected() => Ok(()),
            None => Err(TransportError::InvalidState(
                "in-memory transport cannot be reopened",
            )),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _uri: &Url, _cancel: &CancellationToken) -> Result<()> {
        self.connect().await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.inner.close(cancel).await
    }

    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        self.inner.send(envelope, cancel).await
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
        self.inner.receive(cancel).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn supported_compression(&self) -> Vec<SessionCompression> {
        self.inner.supported_compression()
    }

    fn compression(&self) -> SessionCompression {
        self.inner.compression()
    }

    async fn set_compression(
        &self,
        compression: SessionCompression,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.set_compression(compression, cancel).await
    }

    fn supported_encryption(&self) -> Vec<SessionEncryption> {
        self.inner.supported_encryption()
    }

    fn encryption(&self) -> SessionEncryption {
        self.inner.encryption()
    }

    async fn set_encryption(
        &self,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.set_encryption(encryption, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use lime_envelope::{Command, Session, SessionState};

    use super::*;

    fn memory_uri() -> Url {
        Url::parse("memory://local").unwrap()
    }

    #[tokio::test]
    async fn pair_is_disconnected_until_opened() {
        let (client, server) = MemoryTransport::pair();
        assert!(!client.is_connected());
        let cancel = CancellationToken::new();

        client.open(&memory_uri(), &cancel).await.unwrap();
        server.connect().await.unwrap();
        assert!(client.is_connected());

        client
            .send(&Session::new(SessionState::New).into(), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            server.receive(&cancel).await.unwrap(),
            Envelope::Session(session) if session.state == SessionState::New
        ));
    }

    #[tokio::test]
    async fn cannot_reopen_after_close() {
        let (client, _server) = MemoryTransport::pair();
        let cancel = CancellationToken::new();
        client.connect().await.unwrap();
        client.close(&cancel).await.unwrap();

        let err = client.open(&memory_uri(), &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
        let err = client
            .send(&Command::ping("p").into(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn open_twice_is_idempotent() {
        let (client, _server) = MemoryTransport::pair();
        let cancel = CancellationToken::new();
        client.open(&memory_uri(), &cancel).await.unwrap();
        client.open(&memory_uri(), &cancel).await.unwrap();
        assert!(client.is_connected());
    }
}
