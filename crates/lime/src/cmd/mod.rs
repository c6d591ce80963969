use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use lime_channel::{ChannelBuilder, EstablishedChannelBuilder};
use lime_envelope::Identity;
use lime_transport::{TcpTransport, Transport, TransportConfig};
use url::Url;

use crate::exit::{channel_error, CliError, CliResult};
use crate::output::OutputFormat;

pub mod echo;
pub mod ping;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a TCP server that echoes messages back to their sender.
    Echo(EchoArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Measure the round trip of ping commands.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Ping(args) => ping::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

/// Where to connect and who to be.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Server URI, e.g. net.tcp://localhost:55321.
    #[arg(env = "LIME_URI")]
    pub uri: String,
    /// Identity to authenticate as (name@domain). Connects as a guest when omitted.
    #[arg(long, env = "LIME_IDENTITY")]
    pub identity: Option<String>,
    /// Password for plain authentication.
    #[arg(long, env = "LIME_PASSWORD", hide_env_values = true, requires = "identity")]
    pub password: Option<String>,
    /// Instance name of this node.
    #[arg(long)]
    pub instance: Option<String>,
    /// Bound for connecting and for each send (e.g. 5s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Destination node (name@domain/instance).
    #[arg(long)]
    pub to: Option<String>,
    /// Text content.
    #[arg(long, conflicts_with = "json")]
    pub content: Option<String>,
    /// JSON content, sent as application/json.
    #[arg(long, conflicts_with = "content")]
    pub json: Option<String>,
    /// Wait for one reply (message or notification) and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set.
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Number of pings to send.
    #[arg(long, short = 'n', default_value = "1")]
    pub count: u32,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:55321")]
    pub addr: String,
    /// Domain of the server node and of guest clients.
    #[arg(long, default_value = "localhost")]
    pub domain: String,
    /// Require plain authentication with this password.
    #[arg(long, env = "LIME_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// An established-channel builder for TCP connections described by `args`.
pub fn channel_builder(args: &ConnectArgs) -> CliResult<EstablishedChannelBuilder> {
    let uri = Url::parse(&args.uri)
        .map_err(|err| CliError::usage(format!("invalid uri '{}': {err}", args.uri)))?;
    let timeout = parse_duration(&args.timeout)?;
    let config = TransportConfig {
        connect_timeout: timeout,
        ..TransportConfig::default()
    };

    let mut builder = ChannelBuilder::new(uri, move || {
        Arc::new(TcpTransport::with_config(config.clone())) as Arc<dyn Transport>
    })
    .with_send_timeout(timeout)
    .established();
    if let Some(identity) = &args.identity {
        let identity = identity
            .parse::<Identity>()
            .map_err(|err| CliError::usage(format!("invalid identity: {err}")))?;
        builder = builder.with_identity(identity);
    }
    if let Some(password) = &args.password {
        builder = builder.with_password(password.as_str());
    }
    if let Some(instance) = &args.instance {
        builder = builder.with_instance(instance.as_str());
    }
    builder
        .validate()
        .map_err(|err| channel_error("invalid connection options", err))?;
    Ok(builder)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    fn connect(uri: &str) -> ConnectArgs {
        ConnectArgs {
            uri: uri.to_string(),
            identity: None,
            password: None,
            instance: None,
            timeout: "5s".to_string(),
        }
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration(" ").is_err());
    }

    #[test]
    fn builder_rejects_bad_options_up_front() {
        assert_eq!(channel_builder(&connect("not a uri")).unwrap_err().code, USAGE);

        let mut args = connect("net.tcp://localhost:55321");
        args.identity = Some("alice@example.org".into());
        args.instance = Some(String::new());
        assert_eq!(channel_builder(&args).unwrap_err().code, USAGE);

        args.instance = Some("laptop".into());
        args.password = Some("secret".into());
        assert!(channel_builder(&args).is_ok());
    }
}
