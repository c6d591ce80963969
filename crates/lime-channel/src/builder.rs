use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use lime_transport::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::channel::{Channel, ChannelConfig};
use crate::error::{ChannelError, Result};
use crate::established::EstablishedChannelBuilder;
use crate::state::ChannelRole;

/// Creates a fresh, unopened transport for every build.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Runs against a freshly built or established channel.
pub type ChannelHandler =
    Arc<dyn Fn(Arc<Channel>, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builds client channels to one server.
///
/// Every [`build`](Self::build) creates a new transport, opens it when it
/// is not connected yet, and wraps it in a client [`Channel`]. The session
/// is left in `new`; use [`established`](Self::established) to also run the
/// handshake.
#[derive(Clone)]
pub struct ChannelBuilder {
    server_uri: Url,
    transport_factory: TransportFactory,
    config: ChannelConfig,
    built_handlers: Vec<ChannelHandler>,
}

impl ChannelBuilder {
    pub fn new<F>(server_uri: Url, transport_factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        Self {
            server_uri,
            transport_factory: Arc::new(transport_factory),
            config: ChannelConfig::default(),
            built_handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn with_envelope_buffer_size(mut self, size: usize) -> Self {
        self.config.envelope_buffer_size = size;
        self
    }

    pub fn with_auto_reply_pings(mut self, enabled: bool) -> Self {
        self.config.auto_reply_pings = enabled;
        self
    }

    pub fn with_auto_notify_receipt(mut self, enabled: bool) -> Self {
        self.config.auto_notify_receipt = enabled;
        self
    }

    /// Run `handler` on every built channel. Handlers run in registration
    /// order; a failing handler does not stop the others.
    pub fn add_built_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Channel>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.built_handlers
            .push(Arc::new(move |channel, cancel| handler(channel, cancel).boxed()));
        self
    }

    pub fn server_uri(&self) -> &Url {
        &self.server_uri
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Continue configuring a builder that also establishes the session.
    pub fn established(self) -> EstablishedChannelBuilder {
        EstablishedChannelBuilder::new(self)
    }

    /// Open a transport and wrap it in a client channel.
    ///
    /// When a built handler fails the channel is not closed; the handler
    /// errors are returned together.
    pub async fn build(&self, cancel: &CancellationToken) -> Result<Arc<Channel>> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        let transport = (self.transport_factory)();
        if !transport.is_connected() {
            debug!(uri = %self.server_uri, "opening transport");
            transport.open(&self.server_uri, cancel).await?;
        }
        let channel = Arc::new(Channel::new(
            transport,
            ChannelRole::Client,
            self.config.clone(),
        ));
        run_handlers(&self.built_handlers, &channel, cancel).await?;
        Ok(channel)
    }
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("server_uri", &self.server_uri.as_str())
            .field("config", &self.config)
            .field("built_handlers", &self.built_handlers.len())
            .finish_non_exhaustive()
    }
}

/// Run every handler, then report all failures at once.
pub(crate) async fn run_handlers(
    handlers: &[ChannelHandler],
    channel: &Arc<Channel>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut errors = Vec::new();
    for handler in handlers {
        if let Err(err) = handler(Arc::clone(channel), cancel.clone()).await {
            warn!(error = %err, "channel handler failed");
            errors.push(err);
        }
    }
    match ChannelError::aggregate(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
