use serde::Deserialize;
use serde_json::Value;

pub(in crate::hub) const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, PartialEq)]
pub(in crate::hub) enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        error: Option<String>,
    },
    Other(u8),
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireHandshake {
    #[serde(default)]
    error: Option<String>,
}

pub(in crate::hub) fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

pub(in crate::hub) fn ping() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}

/// A frame may carry several records; the trailing separator leaves an empty tail.
pub(in crate::hub) fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// `Ok(None)` is an accepted handshake, `Ok(Some(reason))` a rejection.
pub(in crate::hub) fn parse_handshake(record: &str) -> Result<Option<String>, serde_json::Error> {
    let parsed: WireHandshake = serde_json::from_str(record)?;
    Ok(parsed.error)
}

pub(in crate::hub) fn parse_message(record: &str) -> Result<HubMessage, serde_json::Error> {
    let wire: WireMessage = serde_json::from_str(record)?;
    Ok(match wire.kind {
        INVOCATION => match wire.target {
            Some(target) => HubMessage::Invocation {
                target,
                arguments: wire.arguments,
            },
            None => HubMessage::Other(INVOCATION),
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close { error: wire.error },
        other => HubMessage::Other(other),
    })
}
