use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::FutureExt;
use lime_envelope::{
    Authentication, AuthenticationScheme, Identity, Node, Session, SessionCompression,
    SessionEncryption, SessionState,
};
use lime_transport::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::{run_handlers, ChannelBuilder, ChannelHandler};
use crate::channel::Channel;
use crate::error::{ChannelError, Result};

/// Picks a compression mode from the candidates the server offered.
pub type CompressionSelector = Arc<dyn Fn(&[SessionCompression]) -> SessionCompression + Send + Sync>;

/// Picks an encryption mode from the candidates the server offered.
pub type EncryptionSelector = Arc<dyn Fn(&[SessionEncryption]) -> SessionEncryption + Send + Sync>;

/// Produces credentials from the offered schemes and the server's
/// challenge of the previous round, if any.
pub type Authenticator =
    Arc<dyn Fn(&[AuthenticationScheme], Option<&Authentication>) -> Authentication + Send + Sync>;

/// Anything that can hand out an established client channel.
#[async_trait]
pub trait EstablishChannel: Send + Sync {
    async fn build_and_establish(&self, cancel: &CancellationToken) -> Result<Arc<Channel>>;
}

#[derive(Clone)]
enum AuthenticationPolicy {
    /// Plain with the configured password when offered, guest otherwise.
    Default,
    Fixed(Authentication),
    Custom(Authenticator),
}

/// Builds client channels and drives the handshake to `established`.
///
/// Without further configuration the strongest offered modes the transport
/// supports are chosen, and the client authenticates as a guest (or with
/// plain credentials once [`with_password`](Self::with_password) is set).
#[derive(Clone)]
pub struct EstablishedChannelBuilder {
    builder: ChannelBuilder,
    compression_selector: CompressionSelector,
    encryption_selector: EncryptionSelector,
    authentication: AuthenticationPolicy,
    identity: Option<Identity>,
    password: Option<String>,
    instance: Option<String>,
    established_handlers: Vec<ChannelHandler>,
}

impl EstablishedChannelBuilder {
    pub fn new(builder: ChannelBuilder) -> Self {
        Self {
            builder,
            compression_selector: Arc::new(strongest_compression),
            encryption_selector: Arc::new(strongest_encryption),
            authentication: AuthenticationPolicy::Default,
            identity: None,
            password: None,
            instance: None,
            established_handlers: Vec::new(),
        }
    }

    pub fn channel_builder(&self) -> &ChannelBuilder {
        &self.builder
    }

    /// Always ask for `compression`, whatever the server offers.
    pub fn with_compression(self, compression: SessionCompression) -> Self {
        self.with_compression_selector(move |_| compression)
    }

    pub fn with_compression_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&[SessionCompression]) -> SessionCompression + Send + Sync + 'static,
    {
        self.compression_selector = Arc::new(selector);
        self
    }

    /// Always ask for `encryption`, whatever the server offers.
    pub fn with_encryption(self, encryption: SessionEncryption) -> Self {
        self.with_encryption_selector(move |_| encryption)
    }

    pub fn with_encryption_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&[SessionEncryption]) -> SessionEncryption + Send + Sync + 'static,
    {
        self.encryption_selector = Arc::new(selector);
        self
    }

    /// Present `authentication` in every round.
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = AuthenticationPolicy::Fixed(authentication);
        self
    }

    pub fn with_authenticator<F>(mut self, authenticator: F) -> Self
    where
        F: Fn(&[AuthenticationScheme], Option<&Authentication>) -> Authentication
            + Send
            + Sync
            + 'static,
    {
        self.authentication = AuthenticationPolicy::Custom(Arc::new(authenticator));
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Run `handler` on every channel once its session is established.
    pub fn add_established_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Channel>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.established_handlers
            .push(Arc::new(move |channel, cancel| handler(channel, cancel).boxed()));
        self
    }

    /// Reject configurations that cannot produce a valid session.
    pub fn validate(&self) -> Result<()> {
        if let Some(identity) = &self.identity {
            if identity.name.is_none() || identity.domain.is_none() {
                return Err(invalid(format!(
                    "identity '{identity}' needs both a name and a domain"
                )));
            }
        }
        match &self.password {
            Some(password) if password.is_empty() => {
                return Err(invalid("password must not be empty"));
            }
            Some(_) if self.identity.is_none() => {
                return Err(invalid("a password requires an identity"));
            }
            _ => {}
        }
        if let Some(instance) = &self.instance {
            if instance.is_empty() || instance.contains('/') {
                return Err(invalid(format!("invalid instance '{instance}'")));
            }
        }
        if let AuthenticationPolicy::Fixed(authentication) = &self.authentication {
            let needs_identity = matches!(
                authentication.scheme(),
                AuthenticationScheme::Plain | AuthenticationScheme::Key
            );
            if needs_identity && self.identity.is_none() {
                return Err(invalid(format!(
                    "{} authentication requires an identity",
                    authentication.scheme()
                )));
            }
        }
        Ok(())
    }

    /// The address presented while authenticating.
    fn local_node(&self) -> Option<Node> {
        let identity = self.identity.clone()?;
        Some(match &self.instance {
            Some(instance) => identity.with_instance(instance.as_str()),
            None => Node::from(identity),
        })
    }

    fn credentials(
        &self,
        schemes: &[AuthenticationScheme],
        challenge: Option<&Authentication>,
    ) -> Authentication {
        match &self.authentication {
            AuthenticationPolicy::Fixed(authentication) => authentication.clone(),
            AuthenticationPolicy::Custom(authenticator) => authenticator(schemes, challenge),
            AuthenticationPolicy::Default => match &self.password {
                Some(password)
                    if schemes.is_empty() || schemes.contains(&AuthenticationScheme::Plain) =>
                {
                    Authentication::plain(password.as_str())
                }
                _ => Authentication::Guest,
            },
        }
    }

    /// Drive `channel` from `new` to `established`.
    async fn establish(&self, channel: &Arc<Channel>, cancel: &CancellationToken) -> Result<()> {
        let mut session = channel.start_new_session(cancel).await?;

        if session.state == SessionState::Negotiating {
            let compression =
                (self.compression_selector)(&compression_candidates(&session, channel.transport()));
            let encryption =
                (self.encryption_selector)(&encryption_candidates(&session, channel.transport()));
            debug!(%compression, %encryption, "negotiating transport options");
            session = channel
                .negotiate_session(compression, encryption, cancel)
                .await?;
            if session.state == SessionState::Negotiating {
                session = channel.receive_session(cancel).await?;
            }
        }

        let from = self.local_node();
        while session.state == SessionState::Authenticating {
            let schemes = session.scheme_options.clone().unwrap_or_default();
            let challenge = session.authentication().ok().flatten();
            let credentials = self.credentials(&schemes, challenge.as_ref());
            debug!(scheme = %credentials.scheme(), "authenticating");
            session = channel
                .authenticate_session(from.clone(), &credentials, cancel)
                .await?;
        }

        match session.state {
            SessionState::Established => {
                run_handlers(&self.established_handlers, channel, cancel).await
            }
            SessionState::Failed => Err(ChannelError::SessionFailed(session.reason)),
            other => Err(ChannelError::UnexpectedSessionState(other)),
        }
    }
}

#[async_trait]
impl EstablishChannel for EstablishedChannelBuilder {
    /// Build a channel and establish its session.
    ///
    /// The configuration is validated before any I/O. If the handshake or
    /// an established handler fails, the channel is closed before the error
    /// is returned.
    async fn build_and_establish(&self, cancel: &CancellationToken) -> Result<Arc<Channel>> {
        self.validate()?;
        let channel = self.builder.build(cancel).await?;
        if let Err(err) = self.establish(&channel, cancel).await {
            debug!(error = %err, "session establishment failed, closing channel");
            if let Err(close_err) = channel.close(&CancellationToken::new()).await {
                debug!(error = %close_err, "channel close failed");
            }
            return Err(err);
        }
        info!(
            uri = %self.builder.server_uri(),
            session_id = ?channel.session_id(),
            local = ?channel.local_node(),
            "session established"
        );
        Ok(channel)
    }
}

impl fmt::Debug for EstablishedChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedChannelBuilder")
            .field("builder", &self.builder)
            .field("identity", &self.identity)
            .field("instance", &self.instance)
            .field("has_password", &self.password.is_some())
            .field("established_handlers", &self.established_handlers.len())
            .finish_non_exhaustive()
    }
}

fn invalid(message: impl Into<String>) -> ChannelError {
    ChannelError::InvalidArgument(message.into())
}

/// Offered options the transport supports; all offered ones if none are.
fn compression_candidates(session: &Session, transport: &Arc<dyn Transport>) -> Vec<SessionCompression> {
    candidates(
        session.compression_options.as_deref(),
        &transport.supported_compression(),
    )
}

fn encryption_candidates(session: &Session, transport: &Arc<dyn Transport>) -> Vec<SessionEncryption> {
    candidates(
        session.encryption_options.as_deref(),
        &transport.supported_encryption(),
    )
}

fn candidates<T: Copy + PartialEq + Default>(offered: Option<&[T]>, supported: &[T]) -> Vec<T> {
    let offered = match offered {
        Some(offered) if !offered.is_empty() => offered.to_vec(),
        _ => vec![T::default()],
    };
    let usable: Vec<T> = offered
        .iter()
        .copied()
        .filter(|option| supported.contains(option))
        .collect();
    if usable.is_empty() {
        offered
    } else {
        usable
    }
}

fn strongest_compression(options: &[SessionCompression]) -> SessionCompression {
    if options.contains(&SessionCompression::Gzip) {
        SessionCompression::Gzip
    } else {
        options.first().copied().unwrap_or_default()
    }
}

fn strongest_encryption(options: &[SessionEncryption]) -> SessionEncryption {
    if options.contains(&SessionEncryption::Tls) {
        SessionEncryption::Tls
    } else {
        options.first().copied().unwrap_or_default()
    }
}
