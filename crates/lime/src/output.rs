use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use lime_envelope::{Envelope, Node};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PingOutput<'a> {
    uri: &'a str,
    session_id: Option<&'a str>,
    round_trip_ms: f64,
}

pub fn print_envelope(envelope: &Envelope, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let header = envelope.header();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "ID", "FROM", "TO", "BODY"])
                .add_row(vec![
                    envelope.kind().to_string(),
                    header.id().unwrap_or("-").to_string(),
                    node_or_dash(header.from.as_ref()),
                    node_or_dash(header.to.as_ref()),
                    summary(envelope),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let header = envelope.header();
            println!(
                "{} id={} from={} to={} {}",
                envelope.kind(),
                header.id().unwrap_or("-"),
                node_or_dash(header.from.as_ref()),
                node_or_dash(header.to.as_ref()),
                summary(envelope)
            );
        }
        OutputFormat::Raw => print_raw(&summary(envelope)),
    }
}

pub fn print_ping(uri: &str, session_id: Option<&str>, round_trip: Duration, format: OutputFormat) {
    let round_trip_ms = round_trip.as_secs_f64() * 1000.0;
    match format {
        OutputFormat::Json => {
            let out = PingOutput {
                uri,
                session_id,
                round_trip_ms,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["URI", "SESSION", "RTT (ms)"])
                .add_row(vec![
                    uri.to_string(),
                    session_id.unwrap_or("-").to_string(),
                    format!("{round_trip_ms:.3}"),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!("pong from {uri} in {round_trip_ms:.3} ms");
        }
    }
}

fn print_raw(text: &str) {
    let mut out = std::io::stdout();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn node_or_dash(node: Option<&Node>) -> String {
    node.map_or_else(|| "-".to_string(), Node::to_string)
}

/// The JSON spelling of a unit enum value.
fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// The kind-specific part of an envelope, as one line.
fn summary(envelope: &Envelope) -> String {
    match envelope {
        Envelope::Message(message) => match &message.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        },
        Envelope::Notification(notification) => {
            let event = wire_name(&notification.event);
            match &notification.reason {
                Some(reason) => format!("{event}: {reason}"),
                None => event,
            }
        }
        Envelope::Command(command) => {
            let mut text = format!(
                "{} {}",
                wire_name(&command.method),
                command.uri.as_deref().unwrap_or("-")
            );
            if let Some(reason) = &command.reason {
                text.push_str(&format!(" ({reason})"));
            }
            text
        }
        Envelope::Session(session) => match &session.reason {
            Some(reason) => format!("{}: {reason}", session.state),
            None => session.state.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use lime_envelope::{Event, Message, Notification, Reason};

    use super::*;

    #[test]
    fn summaries_show_the_interesting_part() {
        assert_eq!(summary(&Envelope::Message(Message::text("hi"))), "hi");
        let failed = Notification::failed(Reason::new(42, "unreachable"));
        assert_eq!(
            summary(&Envelope::Notification(failed)),
            "failed: unreachable (code 42)"
        );
        assert_eq!(
            summary(&Envelope::Notification(Notification::new(Event::Received))),
            "received"
        );
    }
}
