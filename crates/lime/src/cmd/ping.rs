use std::time::Instant;

use lime_channel::{Channel, EstablishChannel};
use lime_envelope::{Command, CommandStatus};
use tokio_util::sync::CancellationToken;

use crate::cmd::{channel_builder, PingArgs};
use crate::exit::{channel_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{print_ping, OutputFormat};

pub async fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    if args.count == 0 {
        return Err(CliError::new(USAGE, "--count must be greater than zero"));
    }
    let builder = channel_builder(&args.connect)?;
    let cancel = CancellationToken::new();
    let channel = builder
        .build_and_establish(&cancel)
        .await
        .map_err(|err| channel_error("connect failed", err))?;

    let result = ping_all(&channel, &args, format, &cancel).await;
    end_session(&channel, &cancel).await;
    result
}

async fn ping_all(
    channel: &Channel,
    args: &PingArgs,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> CliResult<i32> {
    let session_id = channel.session_id();
    for _ in 0..args.count {
        let started = Instant::now();
        let response = channel
            .process_command(Command::ping(uuid::Uuid::new_v4().to_string()), cancel)
            .await
            .map_err(|err| channel_error("ping failed", err))?;
        if response.status != CommandStatus::Success {
            let reason = response
                .reason
                .map_or_else(|| "no reason given".to_string(), |reason| reason.to_string());
            return Err(CliError::new(FAILURE, format!("ping refused: {reason}")));
        }
        print_ping(
            &args.connect.uri,
            session_id.as_deref(),
            started.elapsed(),
            format,
        );
    }
    Ok(SUCCESS)
}

async fn end_session(channel: &Channel, cancel: &CancellationToken) {
    let finished = async {
        channel.send_finishing_session(cancel).await?;
        channel.receive_finished_session(cancel).await
    };
    if let Err(err) = finished.await {
        tracing::debug!(error = %err, "finishing the session failed");
    }
    if let Err(err) = channel.close(cancel).await {
        tracing::debug!(error = %err, "closing the channel failed");
    }
}
