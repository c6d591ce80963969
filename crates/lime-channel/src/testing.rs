//! In-memory channel fixtures shared by the unit tests.

use std::sync::{Arc, Mutex};

use lime_envelope::{Authentication, Message, Node, SessionState};
use lime_transport::{MemoryTransport, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelConfig};
use crate::server::{establish_server_session, ServerSessionOptions};
use crate::state::ChannelRole;

pub(crate) fn alice() -> Node {
    Node::new("alice", "example.org", "phone")
}

/// Two channels over a connected memory pair, neither with a session yet.
pub(crate) async fn connected_pair(
    client_config: ChannelConfig,
    server_config: ChannelConfig,
) -> (Arc<Channel>, Arc<Channel>) {
    let (client_end, server_end) = MemoryTransport::pair();
    client_end.connect().await.unwrap();
    server_end.connect().await.unwrap();
    let client = Channel::new(Arc::new(client_end), ChannelRole::Client, client_config);
    let server = Channel::new(Arc::new(server_end), ChannelRole::Server, server_config);
    (Arc::new(client), Arc::new(server))
}

/// Two channels with an established guest session for [`alice`].
pub(crate) async fn established_pair(
    client_config: ChannelConfig,
    server_config: ChannelConfig,
) -> (Arc<Channel>, Arc<Channel>) {
    let (client, server) = connected_pair(client_config, server_config).await;
    let cancel = CancellationToken::new();
    let options = ServerSessionOptions::default().with_node(Node::new("postmaster", "example.org", "server"));

    let (accepted, opened) = tokio::join!(
        establish_server_session(&server, &options, &cancel),
        async {
            client.start_new_session(&cancel).await?;
            client
                .authenticate_session(Some(alice()), &Authentication::Guest, &cancel)
                .await
        }
    );
    assert_eq!(accepted.unwrap(), alice());
    assert_eq!(opened.unwrap().state, SessionState::Established);
    (client, server)
}

/// Serve one session on `transport`: accept it, echo messages back, and
/// answer `finishing` with `finished`.
pub(crate) fn spawn_echo_server(transport: Arc<MemoryTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        if transport.connect().await.is_err() {
            return;
        }
        let channel = Channel::server(transport);
        if establish_server_session(&channel, &ServerSessionOptions::default(), &cancel)
            .await
            .is_err()
        {
            return;
        }
        loop {
            tokio::select! {
                message = channel.receive_message(&cancel) => {
                    let Ok(message) = message else { break };
                    let mut echo = Message::new(message.media_type.clone(), message.content.clone());
                    echo.header.to = message.header.from.clone();
                    if channel.send_message(echo, &cancel).await.is_err() {
                        break;
                    }
                }
                session = channel.receive_session(&cancel) => {
                    if matches!(session, Ok(ref s) if s.state == SessionState::Finishing) {
                        let _ = channel.send_finished_session(&cancel).await;
                    }
                    break;
                }
            }
        }
    })
}

/// Server ends handed out by [`echo_factory`], oldest first.
pub(crate) type ServerEnds = Arc<Mutex<Vec<Arc<MemoryTransport>>>>;

/// A transport factory whose every client end is served by [`spawn_echo_server`].
pub(crate) fn echo_factory() -> (
    impl Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    ServerEnds,
) {
    let servers = ServerEnds::default();
    let handed_out = Arc::clone(&servers);
    let factory = move || -> Arc<dyn Transport> {
        let (client_end, server_end) = MemoryTransport::pair();
        let server_end = Arc::new(server_end);
        handed_out.lock().unwrap().push(Arc::clone(&server_end));
        spawn_echo_server(server_end);
        Arc::new(client_end)
    };
    (factory, servers)
}
