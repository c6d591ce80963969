use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use lime_envelope::{Envelope, SessionCompression, SessionEncryption};
use lime_frame::{EnvelopeCodec, FrameConfig, FrameError};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::traits::{BoxedStream, StreamUpgrader};

/// Default timeout for establishing a connection: 30 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type EnvelopeReader = FramedRead<ReadHalf<BoxedStream>, EnvelopeCodec>;
type EnvelopeWriter = FramedWrite<WriteHalf<BoxedStream>, EnvelopeCodec>;

/// Configuration shared by the stream-backed transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Framing limits for both directions.
    pub frame: FrameConfig,
    /// Upper bound for `open`.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Envelope exchange over any attached duplex byte stream.
///
/// The read and write halves sit behind separate async mutexes; each mutex is
/// the single permit for its direction. Replacing the stream takes both.
/// A transport is single-use: once closed it cannot be attached again.
pub struct StreamTransport {
    name: &'static str,
    config: TransportConfig,
    reader: Mutex<Option<EnvelopeReader>>,
    writer: Mutex<Option<EnvelopeWriter>>,
    connected: AtomicBool,
    closed: CancellationToken,
    compression: StdMutex<SessionCompression>,
    encryption: StdMutex<SessionEncryption>,
    upgrader: Option<Arc<dyn StreamUpgrader>>,
}

impl StreamTransport {
    /// Create a detached transport. `name` labels log events.
    pub fn new(name: &'static str, config: TransportConfig) -> Self {
        Self {
            name,
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
            compression: StdMutex::new(SessionCompression::None),
            encryption: StdMutex::new(SessionEncryption::None),
            upgrader: None,
        }
    }

    /// Enable encryption modes offered by `upgrader`.
    pub fn set_upgrader(&mut self, upgrader: Arc<dyn StreamUpgrader>) {
        self.upgrader = Some(upgrader);
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Start exchanging envelopes over `stream`.
    pub async fn attach(&self, stream: BoxedStream) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::InvalidState("transport already closed"));
        }
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        if writer.is_some() || reader.is_some() {
            return Err(TransportError::InvalidState("transport already open"));
        }
        let (framed_reader, framed_writer) = self.frame(stream);
        *reader = Some(framed_reader);
        *writer = Some(framed_writer);
        self.connected.store(true, Ordering::Release);
        debug!(transport = self.name, "transport opened");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    pub async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        self.ensure_connected()?;
        let payload = Bytes::from(envelope.to_vec()?);

        let mut guard = acquire(&self.writer, cancel).await?;
        let writer = guard
            .as_mut()
            .ok_or(TransportError::InvalidState("transport is not open"))?;

        trace!(
            transport = self.name,
            envelope = %String::from_utf8_lossy(&payload),
            "sending envelope"
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            result = writer.send(payload) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(err @ FrameError::EnvelopeTooLarge { .. }) => Err(err.into()),
            Err(err) => {
                warn!(transport = self.name, error = %err, "send failed; closing transport");
                guard.take();
                self.force_close();
                Err(err.into())
            }
        }
    }

    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
        self.ensure_connected()?;

        let mut guard = acquire(&self.reader, cancel).await?;
        let reader = guard
            .as_mut()
            .ok_or(TransportError::InvalidState("transport is not open"))?;

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            next = reader.next() => next,
        };

        match next {
            Some(Ok(payload)) => {
                trace!(
                    transport = self.name,
                    envelope = %String::from_utf8_lossy(&payload),
                    "received envelope"
                );
                Ok(Envelope::from_slice(&payload)?)
            }
            Some(Err(err)) => {
                warn!(transport = self.name, error = %err, "receive failed; closing transport");
                guard.take();
                self.force_close();
                Err(err.into())
            }
            None => {
                debug!(transport = self.name, "stream ended by remote peer");
                guard.take();
                self.force_close();
                Err(TransportError::Closed)
            }
        }
    }

    /// Shut the stream down. Pending sends and receives fail with `Closed`.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.force_close();
        let writer = acquire(&self.writer, cancel).await?.take();
        let reader = acquire(&self.reader, cancel).await?.take();

        match (reader, writer) {
            (Some(reader), Some(writer)) => {
                let mut stream = reader.into_inner().unsplit(writer.into_inner());
                if let Err(err) = stream.shutdown().await {
                    debug!(transport = self.name, error = %err, "stream shutdown failed");
                }
                debug!(transport = self.name, "transport closed");
            }
            (_, Some(mut writer)) => {
                if let Err(err) = writer.close().await {
                    debug!(transport = self.name, error = %err, "stream shutdown failed");
                }
                debug!(transport = self.name, "transport closed");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn supported_compression(&self) -> Vec<SessionCompression> {
        vec![SessionCompression::None]
    }

    pub fn compression(&self) -> SessionCompression {
        *self
            .compression
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn set_compression(
        &self,
        compression: SessionCompression,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.supported_compression().contains(&compression) {
            return Err(TransportError::NotSupported(format!(
                "compression '{compression}'"
            )));
        }
        self.ensure_connected()?;

        // Both permits, same as an encryption swap.
        let _writer_guard = acquire(&self.writer, cancel).await?;
        let _reader_guard = acquire(&self.reader, cancel).await?;
        let mut current = self
            .compression
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != compression {
            debug!(transport = self.name, %compression, "stream compression changed");
            *current = compression;
        }
        Ok(())
    }

    pub fn supported_encryption(&self) -> Vec<SessionEncryption> {
        let mut supported = vec![SessionEncryption::None];
        if let Some(upgrader) = &self.upgrader {
            for encryption in upgrader.supported_encryption() {
                if !supported.contains(&encryption) {
                    supported.push(encryption);
                }
            }
        }
        supported
    }

    pub fn encryption(&self) -> SessionEncryption {
        *self.encryption.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn set_encryption(
        &self,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if encryption == self.encryption() {
            return Ok(());
        }
        if encryption == SessionEncryption::None || !self.supported_encryption().contains(&encryption)
        {
            return Err(TransportError::NotSupported(format!(
                "encryption '{encryption}'"
            )));
        }
        let upgrader = self
            .upgrader
            .clone()
            .ok_or_else(|| TransportError::NotSupported(format!("encryption '{encryption}'")))?;
        self.ensure_connected()?;

        let mut writer_guard = acquire(&self.writer, cancel).await?;
        let mut reader_guard = acquire(&self.reader, cancel).await?;
        let (Some(reader), Some(mut writer)) = (reader_guard.take(), writer_guard.take()) else {
            self.force_close();
            return Err(TransportError::InvalidState("transport is not open"));
        };

        if let Err(err) = writer.flush().await {
            self.force_close();
            return Err(err.into());
        }
        if !reader.read_buffer().is_empty() {
            self.force_close();
            return Err(TransportError::InvalidState(
                "unread bytes pending before stream upgrade",
            ));
        }

        let stream = reader.into_inner().unsplit(writer.into_inner());
        let upgraded = match upgrader.upgrade(stream, encryption).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(transport = self.name, error = %err, "stream upgrade failed; closing transport");
                self.force_close();
                return Err(err.into());
            }
        };

        let (framed_reader, framed_writer) = self.frame(upgraded);
        *reader_guard = Some(framed_reader);
        *writer_guard = Some(framed_writer);
        *self
            .encryption
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = encryption;
        debug!(transport = self.name, %encryption, "stream encryption changed");
        Ok(())
    }

    fn frame(&self, stream: BoxedStream) -> (EnvelopeReader, EnvelopeWriter) {
        let (read_half, write_half) = tokio::io::split(stream);
        (
            FramedRead::new(read_half, EnvelopeCodec::with_config(self.config.frame.clone())),
            FramedWrite::new(write_half, EnvelopeCodec::with_config(self.config.frame.clone())),
        )
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::InvalidState("transport is not open"))
        }
    }

    fn force_close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.cancel();
    }
}

async fn acquire<'a, T>(
    permit: &'a Mutex<T>,
    cancel: &CancellationToken,
) -> Result<MutexGuard<'a, T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        guard = permit.lock() => Ok(guard),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use lime_envelope::{Message, Notification, Event};
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn attached_pair(config: TransportConfig) -> (StreamTransport, StreamTransport) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let a = StreamTransport::new("test-a", config.clone());
        let b = StreamTransport::new("test-b", config);
        a.attach(Box::new(left)).await.unwrap();
        b.attach(Box::new(right)).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn send_before_attach_is_invalid_state() {
        let transport = StreamTransport::new("test", TransportConfig::default());
        let cancel = CancellationToken::new();
        let err = transport
            .send(&Message::text("hi").into(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
        let err = transport.receive(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn roundtrip_preserves_order() {
        let (a, b) = attached_pair(TransportConfig::default()).await;
        let cancel = CancellationToken::new();

        for i in 0..50 {
            let envelope = Message::text(format!("msg-{i}")).with_id(i.to_string());
            a.send(&envelope.into(), &cancel).await.unwrap();
        }
        for i in 0..50 {
            match b.receive(&cancel).await.unwrap() {
                Envelope::Message(message) => assert_eq!(message.id(), Some(i.to_string().as_str())),
                other => panic!("unexpected envelope {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn send_and_receive_run_concurrently() {
        let (a, b) = attached_pair(TransportConfig::default()).await;
        let a = Arc::new(a);
        let cancel = CancellationToken::new();

        let receiver = {
            let a = Arc::clone(&a);
            let cancel = cancel.clone();
            tokio::spawn(async move { a.receive(&cancel).await })
        };
        tokio::task::yield_now().await;

        // The pending receive holds only the read permit.
        a.send(&Notification::new(Event::Received).into(), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            b.receive(&cancel).await.unwrap(),
            Envelope::Notification(_)
        ));

        b.send(&Message::text("back").into(), &cancel).await.unwrap();
        assert!(matches!(
            receiver.await.unwrap().unwrap(),
            Envelope::Message(_)
        ));
    }

    #[tokio::test]
    async fn overflow_closes_transport() {
        let (left, mut right) = tokio::io::duplex(64 * 1024);
        let transport = StreamTransport::new(
            "test",
            TransportConfig {
                frame: FrameConfig { max_buffer_size: 64 },
                ..TransportConfig::default()
            },
        );
        transport.attach(Box::new(left)).await.unwrap();

        right.write_all(b"{\"content\":\"").await.unwrap();
        right.write_all(&[b'x'; 256]).await.unwrap();

        let err = transport
            .receive(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Frame(FrameError::BufferOverflow { .. })
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn cancelled_receive_keeps_transport_open() {
        let (a, _b) = attached_pair(TransportConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = a.receive(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn close_is_observed_by_both_sides() {
        let (a, b) = attached_pair(TransportConfig::default()).await;
        let cancel = CancellationToken::new();

        a.close(&cancel).await.unwrap();
        assert!(!a.is_connected());
        let err = a
            .send(&Message::text("late").into(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));

        let err = b.receive(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(!b.is_connected());

        // Closing twice is harmless; reattaching is not allowed.
        a.close(&cancel).await.unwrap();
        let (stream, _) = tokio::io::duplex(16);
        assert!(matches!(
            a.attach(Box::new(stream)).await,
            Err(TransportError::InvalidState(_))
        ));
    }

    struct CountingUpgrader {
        upgrades: AtomicUsize,
    }

    #[async_trait]
    impl StreamUpgrader for CountingUpgrader {
        fn supported_encryption(&self) -> Vec<SessionEncryption> {
            vec![SessionEncryption::Tls]
        }

        async fn upgrade(
            &self,
            stream: BoxedStream,
            _encryption: SessionEncryption,
        ) -> std::io::Result<BoxedStream> {
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            Ok(stream)
        }
    }

    #[tokio::test]
    async fn encryption_swaps_stream_and_keeps_exchanging() {
        let upgrader = Arc::new(CountingUpgrader {
            upgrades: AtomicUsize::new(0),
        });
        let (left, right) = tokio::io::duplex(64 * 1024);
        let mut a = StreamTransport::new("test-a", TransportConfig::default());
        a.set_upgrader(upgrader.clone());
        let b = StreamTransport::new("test-b", TransportConfig::default());
        a.attach(Box::new(left)).await.unwrap();
        b.attach(Box::new(right)).await.unwrap();

        assert_eq!(
            a.supported_encryption(),
            vec![SessionEncryption::None, SessionEncryption::Tls]
        );
        assert_eq!(b.supported_encryption(), vec![SessionEncryption::None]);

        let cancel = CancellationToken::new();
        a.set_encryption(SessionEncryption::Tls, &cancel).await.unwrap();
        a.set_encryption(SessionEncryption::Tls, &cancel).await.unwrap();
        assert_eq!(upgrader.upgrades.load(Ordering::SeqCst), 1);
        assert_eq!(a.encryption(), SessionEncryption::Tls);

        a.send(&Message::text("after upgrade").into(), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            b.receive(&cancel).await.unwrap(),
            Envelope::Message(_)
        ));

        let err = b
            .set_encryption(SessionEncryption::Tls, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotSupported(_)));
    }

    #[tokio::test]
    async fn only_plain_compression_is_offered() {
        let (a, _b) = attached_pair(TransportConfig::default()).await;
        let cancel = CancellationToken::new();
        assert_eq!(a.supported_compression(), vec![SessionCompression::None]);
        a.set_compression(SessionCompression::None, &cancel)
            .await
            .unwrap();
        assert!(matches!(
            a.set_compression(SessionCompression::Gzip, &cancel).await,
            Err(TransportError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn compression_change_waits_for_inflight_receive() {
        let (a, b) = attached_pair(TransportConfig::default()).await;
        let a = Arc::new(a);
        let cancel = CancellationToken::new();

        let receiver = {
            let a = Arc::clone(&a);
            let cancel = cancel.clone();
            tokio::spawn(async move { a.receive(&cancel).await })
        };
        tokio::task::yield_now().await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            a.set_compression(SessionCompression::None, &cancel),
        )
        .await;
        assert!(blocked.is_err(), "read permit is held by the receive");

        b.send(&Message::text("release").into(), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            receiver.await.unwrap().unwrap(),
            Envelope::Message(_)
        ));
        a.set_compression(SessionCompression::None, &cancel)
            .await
            .unwrap();
    }
}
