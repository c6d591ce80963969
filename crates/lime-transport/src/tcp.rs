use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use lime_envelope::{Envelope, SessionCompression, SessionEncryption};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, TransportError};
use crate::stream::{StreamTransport, TransportConfig};
use crate::traits::{StreamUpgrader, Transport};

/// URI schemes accepted by [`TcpTransport::open`].
pub const TCP_SCHEMES: &[&str] = &["net.tcp", "tcp"];

/// Port used when the URI does not name one.
pub const DEFAULT_PORT: u16 = 55321;

/// Envelope transport over a TCP connection.
pub struct TcpTransport {
    inner: StreamTransport,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            inner: StreamTransport::new("tcp", config),
        }
    }

    /// Enable encryption modes offered by `upgrader`.
    pub fn with_upgrader(mut self, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        self.inner.set_upgrader(upgrader);
        self
    }

    /// Wrap an already connected stream, e.g. one accepted by a listener.
    pub async fn from_stream(stream: TcpStream, config: TransportConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let transport = Self::with_config(config);
        transport.inner.attach(Box::new(stream)).await?;
        Ok(transport)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn endpoint(uri: &Url) -> Result<(String, u16)> {
    if !TCP_SCHEMES.contains(&uri.scheme()) {
        return Err(TransportError::InvalidUri(uri.to_string()));
    }
    let host = uri
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidUri(uri.to_string()))?;
    // IPv6 literals come back bracketed from the URL parser.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), uri.port().unwrap_or(DEFAULT_PORT)))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, uri: &Url, cancel: &CancellationToken) -> Result<()> {
        if self.inner.is_connected() {
            return Err(TransportError::InvalidState("transport already open"));
        }
        let (host, port) = endpoint(uri)?;
        let timeout = self.inner.config().connect_timeout;

        let connect = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)));
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(TransportError::Connect {
                        uri: uri.to_string(),
                        source,
                    })
                }
                Err(_) => return Err(TransportError::Timeout(timeout)),
            },
        };
        stream.set_nodelay(true)?;
        debug!(%uri, "connected to tcp endpoint");
        self.inner.attach(Box::new(stream)).await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
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

/// Accepts incoming TCP connections as transports.
pub struct TcpTransportListener {
    listener: TcpListener,
    config: TransportConfig,
    upgrader: Option<Arc<dyn StreamUpgrader>>,
}

impl TcpTransportListener {
    /// Bind and listen on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let display = addr.to_string();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: display,
                source,
            })?;
        info!(addr = ?listener.local_addr().ok(), "listening for tcp transports");
        Ok(Self {
            listener,
            config: TransportConfig::default(),
            upgrader: None,
        })
    }

    /// Override the configuration of accepted transports.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable encryption modes on accepted transports.
    pub fn with_upgrader(mut self, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// Accept the next connection.
    pub async fn accept(&self, cancel: &CancellationToken) -> Result<TcpTransport> {
        let (stream, remote) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            accepted = self.listener.accept() => accepted?,
        };
        debug!(%remote, "accepted tcp connection");
        let mut transport = TcpTransport::with_config(self.config.clone());
        if let Some(upgrader) = &self.upgrader {
            transport.inner.set_upgrader(Arc::clone(upgrader));
        }
        stream.set_nodelay(true)?;
        transport.inner.attach(Box::new(stream)).await?;
        Ok(transport)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use lime_envelope::{Message, Node};

    use super::*;

    #[test]
    fn endpoint_from_uri() {
        let uri = Url::parse("net.tcp://example.org:1234").unwrap();
        assert_eq!(endpoint(&uri).unwrap(), ("example.org".to_string(), 1234));

        let uri = Url::parse("tcp://127.0.0.1").unwrap();
        assert_eq!(endpoint(&uri).unwrap(), ("127.0.0.1".to_string(), DEFAULT_PORT));

        let uri = Url::parse("net.tcp://[::1]:99").unwrap();
        assert_eq!(endpoint(&uri).unwrap(), ("::1".to_string(), 99));
    }

    #[test]
    fn rejects_foreign_schemes() {
        let uri = Url::parse("ws://example.org:80").unwrap();
        assert!(matches!(endpoint(&uri), Err(TransportError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn loopback_roundtrip() {
        let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let transport = listener.accept(&cancel).await.unwrap();
                let envelope = transport.receive(&cancel).await.unwrap();
                transport.send(&envelope, &cancel).await.unwrap();
                transport
            })
        };

        let client = TcpTransport::new();
        let uri = Url::parse(&format!("net.tcp://127.0.0.1:{port}")).unwrap();
        client.open(&uri, &cancel).await.unwrap();
        assert!(client.is_connected());

        let message = Message::text("echo me")
            .with_id("1")
            .with_to(Node::new("bob", "example.org", ""));
        client.send(&message.clone().into(), &cancel).await.unwrap();
        let echoed = client.receive(&cancel).await.unwrap();
        assert_eq!(echoed, Envelope::Message(message));

        let _server_transport = server.await.unwrap();
        client.close(&cancel).await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn connect_refused_is_reported_with_uri() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpTransport::new();
        let uri = Url::parse(&format!("net.tcp://127.0.0.1:{port}")).unwrap();
        let err = client
            .open(&uri, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!client.is_connected());
    }
}
