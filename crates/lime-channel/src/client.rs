//! Client side of the session handshake.

use lime_envelope::{
    Authentication, Node, Session, SessionCompression, SessionEncryption, SessionState,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};

impl Channel {
    /// Send the `new` session and return the server's first reply.
    pub async fn start_new_session(&self, cancel: &CancellationToken) -> Result<Session> {
        self.send_session(Session::new(SessionState::New), cancel)
            .await?;
        self.receive_session(cancel).await
    }

    /// Send the chosen options and return the server's reply.
    ///
    /// If the server confirms, the transport is switched to the confirmed
    /// compression and encryption before returning.
    pub async fn negotiate_session(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let mut choice = Session::new(SessionState::Negotiating);
        choice.compression = Some(compression);
        choice.encryption = Some(encryption);
        self.send_session(choice, cancel).await?;

        let reply = self.receive_session(cancel).await?;
        if reply.state == SessionState::Negotiating {
            apply_negotiated(self, &reply, cancel).await?;
        }
        Ok(reply)
    }

    /// Receive the session offering authentication schemes.
    pub async fn receive_authenticating_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let session = self.receive_session(cancel).await?;
        expect_state(session, SessionState::Authenticating)
    }

    /// Present `authentication` as `from` and return the server's reply:
    /// `established`, `failed`, or another `authenticating` round.
    pub async fn authenticate_session(
        &self,
        from: Option<Node>,
        authentication: &Authentication,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let mut session = Session::new(SessionState::Authenticating).with_authentication(authentication);
        session.header.from = from;
        self.send_session(session, cancel).await?;
        self.receive_session(cancel).await
    }

    pub async fn send_finishing_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.send_session(Session::new(SessionState::Finishing), cancel)
            .await
    }

    pub async fn receive_finished_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let session = self.receive_session(cancel).await?;
        expect_state(session, SessionState::Finished)
    }
}

/// Switch the transport to the modes confirmed in `session`.
pub(crate) async fn apply_negotiated(
    channel: &Channel,
    session: &Session,
    cancel: &CancellationToken,
) -> Result<()> {
    let transport = channel.transport();
    if let Some(compression) = session.compression {
        if compression != transport.compression() {
            transport.set_compression(compression, cancel).await?;
            debug!(%compression, "transport compression changed");
        }
    }
    if let Some(encryption) = session.encryption {
        if encryption != transport.encryption() {
            transport.set_encryption(encryption, cancel).await?;
            debug!(%encryption, "transport encryption changed");
        }
    }
    Ok(())
}

/// Accept `session` if it is in `expected`, otherwise turn it into an error.
pub(crate) fn expect_state(session: Session, expected: SessionState) -> Result<Session> {
    if session.state == expected {
        return Ok(session);
    }
    match session.state {
        SessionState::Failed => Err(ChannelError::SessionFailed(session.reason)),
        other => Err(ChannelError::UnexpectedSessionState(other)),
    }
}
