//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! Only the subset the recognition channel uses is supported: text frames on
//! the default namespace, no binary attachments.

use super::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Engine.IO pong, sent in reply to a server ping
pub(crate) const PONG: &str = "3";

/// Socket.IO connect request for the default namespace
pub(crate) const CONNECT: &str = "40";

/// Socket.IO disconnect for the default namespace
pub(crate) const DISCONNECT: &str = "41";

/// Heartbeat defaults used when the server omits them
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Payload of the Engine.IO open packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Handshake {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

impl Handshake {
    /// How long the connection may stay silent before it counts as dropped
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SocketPacket {
    Connect,
    Disconnect,
    Event { name: String, data: Value },
    Ack,
    ConnectError(String),
}

/// Decode one text frame
pub(crate) fn decode(text: &str) -> Result<Packet, CodecError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let body = chars.as_str();

    match kind {
        '0' => serde_json::from_str::<Handshake>(body)
            .map(Packet::Open)
            .map_err(|e| CodecError::InvalidPayload(format!("open packet: {}", e))),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(body).map(Packet::Message),
        '5' => Ok(Packet::Upgrade),
        '6' => Ok(Packet::Noop),
        other => Err(CodecError::UnknownPacketType(other)),
    }
}

fn decode_socket(body: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = skip_namespace(chars.as_str());

    match kind {
        '0' => Ok(SocketPacket::Connect),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => decode_event(skip_ack_id(rest)),
        '3' => Ok(SocketPacket::Ack),
        '4' => Ok(SocketPacket::ConnectError(connect_error_message(rest))),
        '5' | '6' => Err(CodecError::Unsupported("binary packets")),
        other => Err(CodecError::UnknownPacketType(other)),
    }
}

/// Strip a `/namespace,` prefix if one is present
fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn skip_ack_id(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_event(payload: &str) -> Result<SocketPacket, CodecError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| CodecError::InvalidPayload(format!("event: {}", e)))?;
    let Value::Array(mut items) = value else {
        return Err(CodecError::InvalidPayload("event is not an array".to_string()));
    };
    if items.is_empty() {
        return Err(CodecError::InvalidPayload("event has no name".to_string()));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        other => {
            return Err(CodecError::InvalidPayload(format!(
                "event name is not a string: {}",
                other
            )))
        }
    };
    let data = if items.is_empty() {
        Value::Null
    } else {
        items.remove(0)
    };
    Ok(SocketPacket::Event { name, data })
}

fn connect_error_message(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("connection refused")
            .to_string(),
        Ok(Value::String(message)) => message,
        _ if payload.is_empty() => "connection refused".to_string(),
        _ => payload.to_string(),
    }
}

/// Encode an event for the default namespace
pub(crate) fn encode_event<T: Serialize>(name: &str, data: &T) -> Result<String, CodecError> {
    let payload = serde_json::to_string(&(name, data))
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
    Ok(format!("42{}", payload))
}
