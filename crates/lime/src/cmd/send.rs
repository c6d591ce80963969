use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lime_channel::{ChannelError, EstablishedChannelBuilder, OnDemandChannel};
use lime_envelope::{Envelope, Message, Node};
use tokio_util::sync::CancellationToken;

use crate::cmd::{channel_builder, parse_duration, SendArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_envelope, OutputFormat};

const APPLICATION_JSON: &str = "application/json";

/// How often a failed send or receive is retried on a fresh channel.
const MAX_OPERATION_RETRIES: u32 = 2;

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let message = build_message(&args)?;
    let channel = on_demand(channel_builder(&args.connect)?);
    let cancel = CancellationToken::new();

    let result = exchange(&channel, message, args.wait.then_some(wait_timeout), &cancel).await;
    if let Err(err) = channel.finish(&cancel).await {
        tracing::debug!(error = %err, "finishing the session failed");
    }
    channel.dispose().await;

    if let Some(reply) = result? {
        print_envelope(&reply, format);
    }
    Ok(SUCCESS)
}

/// A single failed build ends the command; broken channels are rebuilt a
/// bounded number of times.
fn on_demand(builder: EstablishedChannelBuilder) -> OnDemandChannel {
    let channel = OnDemandChannel::new(builder);
    channel.on_channel_creation_failed(|failure| {
        tracing::warn!(error = %failure.error, "could not establish a session");
        async { false }
    });
    let retries = Arc::new(AtomicU32::new(0));
    channel.on_channel_operation_failed(move |failure| {
        let attempt = retries.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            operation = failure.operation_name,
            attempt,
            error = %failure.error,
            "channel operation failed"
        );
        async move { attempt <= MAX_OPERATION_RETRIES }
    });
    channel
}

async fn exchange(
    channel: &OnDemandChannel,
    message: Message,
    wait: Option<Duration>,
    cancel: &CancellationToken,
) -> CliResult<Option<Envelope>> {
    channel
        .send_message(message, cancel)
        .await
        .map_err(|err| channel_error("send failed", err))?;
    let Some(wait) = wait else {
        return Ok(None);
    };

    let reply = tokio::time::timeout(wait, async {
        tokio::select! {
            message = channel.receive_message(cancel) => message.map(Envelope::Message),
            notification = channel.receive_notification(cancel) => {
                notification.map(Envelope::Notification)
            }
        }
    })
    .await
    .map_err(|_| CliError::new(TIMEOUT, format!("no reply within {wait:?}")))?;
    reply
        .map(Some)
        .map_err(|err: ChannelError| channel_error("receive failed", err))
}

fn build_message(args: &SendArgs) -> CliResult<Message> {
    let mut message = match (&args.json, &args.content) {
        (Some(json), _) => {
            let content = serde_json::from_str(json)
                .map_err(|err| CliError::usage(format!("--json is not valid JSON: {err}")))?;
            Message::new(APPLICATION_JSON, content)
        }
        (None, Some(text)) => Message::text(text.as_str()),
        (None, None) => return Err(CliError::usage("one of --content or --json is required")),
    };
    if let Some(to) = &args.to {
        let to: Node = to
            .parse()
            .map_err(|err| CliError::usage(format!("invalid --to node: {err}")))?;
        message.header.to = Some(to);
    }
    if args.wait {
        message.header.id = Some(uuid::Uuid::new_v4().to_string());
    }
    Ok(message)
}
