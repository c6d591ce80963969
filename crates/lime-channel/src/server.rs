//! Server side of the session handshake.

use std::fmt;
use std::sync::Arc;

use lime_envelope::{
    Authentication, AuthenticationScheme, Node, Reason, Session, SessionCompression,
    SessionEncryption, SessionState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::client::{apply_negotiated, expect_state};
use crate::error::{ChannelError, Result};

/// The client chose options the server did not offer.
pub const REASON_INVALID_NEGOTIATION: i32 = 17;

/// The client credentials were rejected.
pub const REASON_AUTHENTICATION_FAILED: i32 = 13;

/// Decides whether a client may open a session as `from` with `authentication`.
pub type ServerAuthenticator = Arc<dyn Fn(Option<&Node>, &Authentication) -> bool + Send + Sync>;

/// What a server offers while establishing a session.
#[derive(Clone)]
pub struct ServerSessionOptions {
    pub compression_options: Vec<SessionCompression>,
    pub encryption_options: Vec<SessionEncryption>,
    pub scheme_options: Vec<AuthenticationScheme>,
    /// The server's own address, sent as `from` of the established session.
    pub node: Option<Node>,
    authenticator: ServerAuthenticator,
}

impl Default for ServerSessionOptions {
    fn default() -> Self {
        Self {
            compression_options: vec![SessionCompression::None],
            encryption_options: vec![SessionEncryption::None],
            scheme_options: vec![AuthenticationScheme::Guest, AuthenticationScheme::Plain],
            node: None,
            authenticator: Arc::new(|_, _| true),
        }
    }
}

impl ServerSessionOptions {
    pub fn with_compression_options(mut self, options: Vec<SessionCompression>) -> Self {
        self.compression_options = options;
        self
    }

    pub fn with_encryption_options(mut self, options: Vec<SessionEncryption>) -> Self {
        self.encryption_options = options;
        self
    }

    pub fn with_scheme_options(mut self, options: Vec<AuthenticationScheme>) -> Self {
        self.scheme_options = options;
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    /// Check credentials with `authenticator`. The default accepts everyone.
    pub fn with_authenticator<F>(mut self, authenticator: F) -> Self
    where
        F: Fn(Option<&Node>, &Authentication) -> bool + Send + Sync + 'static,
    {
        self.authenticator = Arc::new(authenticator);
        self
    }
}

impl fmt::Debug for ServerSessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSessionOptions")
            .field("compression_options", &self.compression_options)
            .field("encryption_options", &self.encryption_options)
            .field("scheme_options", &self.scheme_options)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Receive the client's `new` session.
    pub async fn receive_new_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let session = self.receive_session(cancel).await?;
        expect_state(session, SessionState::New)
    }

    /// Offer transport options to the client.
    pub async fn send_negotiating_options(
        &self,
        compression_options: Vec<SessionCompression>,
        encryption_options: Vec<SessionEncryption>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut offer = Session::new(SessionState::Negotiating);
        offer.compression_options = Some(compression_options);
        offer.encryption_options = Some(encryption_options);
        self.send_session(offer, cancel).await
    }

    /// Receive the client's chosen transport options.
    pub async fn receive_negotiating_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let session = self.receive_session(cancel).await?;
        expect_state(session, SessionState::Negotiating)
    }

    /// Confirm the chosen options and switch the transport to them.
    pub async fn send_negotiating_confirmation(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut confirmation = Session::new(SessionState::Negotiating);
        confirmation.compression = Some(compression);
        confirmation.encryption = Some(encryption);
        self.send_session(confirmation.clone(), cancel).await?;
        apply_negotiated(self, &confirmation, cancel).await
    }

    /// Offer authentication schemes to the client.
    pub async fn send_authenticating_options(
        &self,
        scheme_options: Vec<AuthenticationScheme>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut offer = Session::new(SessionState::Authenticating);
        offer.scheme_options = Some(scheme_options);
        self.send_session(offer, cancel).await
    }

    /// Accept the session for `remote`.
    pub async fn send_established_session(
        &self,
        local: Option<Node>,
        remote: Node,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut established = Session::new(SessionState::Established).with_to(remote);
        established.header.from = local;
        self.send_session(established, cancel).await
    }

    /// Receive the client's request to end the session.
    pub async fn receive_finishing_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let session = self.receive_session(cancel).await?;
        expect_state(session, SessionState::Finishing)
    }

    pub async fn send_finished_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.send_session(Session::new(SessionState::Finished), cancel)
            .await
    }

    pub async fn send_failed_session(&self, reason: Reason, cancel: &CancellationToken) -> Result<()> {
        self.send_session(Session::failed(reason), cancel).await
    }
}

/// Drive a server channel from `new` to `established`.
///
/// Negotiation is skipped when there is nothing to choose. On rejected
/// options or credentials the session is failed and
/// [`ChannelError::SessionFailed`] is returned. Returns the client's node.
pub async fn establish_server_session(
    channel: &Channel,
    options: &ServerSessionOptions,
    cancel: &CancellationToken,
) -> Result<Node> {
    channel.receive_new_session(cancel).await?;
    let transport = channel.transport();

    let compression_options = offered(
        &options.compression_options,
        &transport.supported_compression(),
    );
    let encryption_options = offered(
        &options.encryption_options,
        &transport.supported_encryption(),
    );
    if compression_options.len() > 1 || encryption_options.len() > 1 {
        channel
            .send_negotiating_options(
                compression_options.clone(),
                encryption_options.clone(),
                cancel,
            )
            .await?;
        let choice = channel.receive_negotiating_session(cancel).await?;
        let compression = choice.compression.unwrap_or_default();
        let encryption = choice.encryption.unwrap_or_default();
        if !compression_options.contains(&compression) || !encryption_options.contains(&encryption)
        {
            let reason = Reason::new(REASON_INVALID_NEGOTIATION, "invalid negotiation options");
            return fail(channel, reason, cancel).await;
        }
        channel
            .send_negotiating_confirmation(compression, encryption, cancel)
            .await?;
    }

    channel
        .send_authenticating_options(options.scheme_options.clone(), cancel)
        .await?;
    let attempt = channel.receive_authenticating_session(cancel).await?;
    let authentication = match attempt.authentication() {
        Ok(Some(authentication)) => authentication,
        Ok(None) => {
            let reason = Reason::new(REASON_AUTHENTICATION_FAILED, "missing authentication");
            return fail(channel, reason, cancel).await;
        }
        Err(err) => {
            debug!(error = %err, "malformed authentication document");
            let reason = Reason::new(REASON_AUTHENTICATION_FAILED, "invalid authentication");
            return fail(channel, reason, cancel).await;
        }
    };
    if !options.scheme_options.contains(&authentication.scheme())
        || !(options.authenticator)(attempt.header.from.as_ref(), &authentication)
    {
        warn!(
            from = ?attempt.header.from,
            scheme = %authentication.scheme(),
            "client authentication rejected"
        );
        let reason = Reason::new(REASON_AUTHENTICATION_FAILED, "authentication failed");
        return fail(channel, reason, cancel).await;
    }

    let remote = client_node(attempt.header.from, channel.session_id(), options.node.as_ref());
    channel
        .send_established_session(options.node.clone(), remote.clone(), cancel)
        .await?;
    info!(session_id = ?channel.session_id(), remote = %remote, "session established");
    Ok(remote)
}

/// Options both configured and supported by the transport, never empty.
fn offered<T: Copy + PartialEq + Default>(configured: &[T], supported: &[T]) -> Vec<T> {
    let options: Vec<T> = configured
        .iter()
        .copied()
        .filter(|option| supported.contains(option))
        .collect();
    if options.is_empty() {
        vec![T::default()]
    } else {
        options
    }
}

/// The node a client is known by; anonymous guests are named after the session.
fn client_node(from: Option<Node>, session_id: Option<String>, server: Option<&Node>) -> Node {
    let mut node = from.unwrap_or_default();
    if node.name.is_none() {
        node.name = session_id;
    }
    if node.domain.is_none() {
        node.domain = server.and_then(|server| server.domain.clone());
    }
    node
}

async fn fail<T>(channel: &Channel, reason: Reason, cancel: &CancellationToken) -> Result<T> {
    channel.send_failed_session(reason.clone(), cancel).await?;
    Err(ChannelError::SessionFailed(Some(reason)))
}

#[cfg(test)]
mod tests {
    use lime_envelope::Message;

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::testing::{alice, connected_pair};

    #[test]
    fn offered_options_fall_back_to_plain() {
        assert_eq!(
            offered(
                &[SessionEncryption::Tls, SessionEncryption::None],
                &[SessionEncryption::None]
            ),
            vec![SessionEncryption::None]
        );
        assert_eq!(
            offered(&[SessionEncryption::Tls], &[SessionEncryption::None]),
            vec![SessionEncryption::None]
        );
    }

    #[test]
    fn guests_are_named_after_the_session() {
        let server = Node::new("postmaster", "example.org", "");
        let node = client_node(None, Some("abc".into()), Some(&server));
        assert_eq!(node, Node::new("abc", "example.org", ""));

        let node = client_node(Some(alice()), Some("abc".into()), Some(&server));
        assert_eq!(node, alice());
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_session() {
        let (client, server) = connected_pair(ChannelConfig::default(), ChannelConfig::default()).await;
        let cancel = CancellationToken::new();
        let options = ServerSessionOptions::default()
            .with_scheme_options(vec![AuthenticationScheme::Plain])
            .with_authenticator(|_, authentication| {
                authentication == &Authentication::plain("letmein")
            });

        let server_side = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                establish_server_session(&server, &options, &CancellationToken::new()).await
            })
        };

        let schemes = client.start_new_session(&cancel).await.unwrap();
        assert_eq!(schemes.state, SessionState::Authenticating);
        let reply = client
            .authenticate_session(Some(alice()), &Authentication::plain("wrong"), &cancel)
            .await
            .unwrap();
        assert_eq!(reply.state, SessionState::Failed);
        assert_eq!(
            reply.reason.map(|reason| reason.code),
            Some(REASON_AUTHENTICATION_FAILED)
        );
        assert_eq!(client.state(), SessionState::Failed);

        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::SessionFailed(Some(_))));
        assert_eq!(server.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn unoffered_negotiation_choice_is_refused() {
        let (client, server) = connected_pair(ChannelConfig::default(), ChannelConfig::default()).await;
        let cancel = CancellationToken::new();
        // Two compression entries force a negotiation round even though
        // the transport only supports one of them.
        let options = ServerSessionOptions::default()
            .with_compression_options(vec![SessionCompression::None, SessionCompression::None]);

        let server_side = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                establish_server_session(&server, &options, &CancellationToken::new()).await
            })
        };

        let offer = client.start_new_session(&cancel).await.unwrap();
        assert_eq!(offer.state, SessionState::Negotiating);
        let reply = client
            .negotiate_session(SessionCompression::Gzip, SessionEncryption::None, &cancel)
            .await
            .unwrap();
        assert_eq!(reply.state, SessionState::Failed);
        assert!(matches!(
            server_side.await.unwrap(),
            Err(ChannelError::SessionFailed(_))
        ));
        assert!(client
            .send_message(Message::text("never"), &cancel)
            .await
            .is_err());
    }
}
