use std::sync::Arc;

use lime_channel::{establish_server_session, Channel, ChannelError, ServerSessionOptions};
use lime_envelope::{Authentication, AuthenticationScheme, Message, Node, SessionState};
use lime_transport::{TcpTransport, TcpTransportListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cmd::EchoArgs;
use crate::exit::{transport_error, CliResult, SUCCESS};

pub async fn run(args: EchoArgs) -> CliResult<i32> {
    let listener = TcpTransportListener::bind(args.addr.as_str())
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let options = session_options(&args);
    let shutdown = CancellationToken::new();

    loop {
        let transport = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down echo server");
                break;
            }
            accepted = listener.accept(&shutdown) => {
                accepted.map_err(|err| transport_error("accept failed", err))?
            }
        };
        let options = options.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(transport, &options, &shutdown).await {
                debug!(error = %err, "echo session ended");
            }
        });
    }

    shutdown.cancel();
    Ok(SUCCESS)
}

/// Guests are welcome unless a password is configured, in which case only
/// plain authentication with that password is accepted.
fn session_options(args: &EchoArgs) -> ServerSessionOptions {
    let options = ServerSessionOptions::default().with_node(Node::new(
        "postmaster",
        args.domain.as_str(),
        "echo",
    ));
    match &args.password {
        Some(password) => {
            let expected = Authentication::plain(password.as_str());
            options
                .with_scheme_options(vec![AuthenticationScheme::Plain])
                .with_authenticator(move |_, authentication| authentication == &expected)
        }
        None => options,
    }
}

async fn serve(
    transport: TcpTransport,
    options: &ServerSessionOptions,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    let channel = Channel::server(Arc::new(transport));
    let remote = establish_server_session(&channel, options, shutdown).await?;
    info!(session_id = ?channel.session_id(), %remote, "echo session started");

    loop {
        tokio::select! {
            message = channel.receive_message(shutdown) => {
                let message = message?;
                let sender = message.header.sender().cloned().unwrap_or_else(|| remote.clone());
                debug!(to = %sender, "echoing message");
                let mut echo = Message::new(message.media_type, message.content);
                echo.header.id = message.header.id;
                echo.header.to = Some(sender);
                channel.send_message(echo, shutdown).await?;
            }
            session = channel.receive_session(shutdown) => {
                let session = session?;
                if session.state == SessionState::Finishing {
                    channel.send_finished_session(shutdown).await?;
                }
                info!(session_id = ?channel.session_id(), "echo session finished");
                return Ok(());
            }
        }
    }
}
