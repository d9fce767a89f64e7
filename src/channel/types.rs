//! Realtime channel message types
//!
//! Every frame is a `{"type": ..., "data": ...}` envelope. The envelope is
//! decoded first and the payload second, so an unknown `type` is told apart
//! from a malformed payload of a known one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

/// Connection state of the channel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Camera status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub id: String,
    /// Status as reported by the server (e.g. `ONLINE`, `OFFLINE`)
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

/// Upstream stream health as judged by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealthStatus {
    Frozen,
    Offline,
    Online,
    Restarted,
    RestartFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHealth {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: StreamHealthStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

/// A recognized inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection acknowledgment; payload is server-defined
    Connected(Value),
    CameraStatus(CameraStatus),
    StreamHealth(StreamHealth),
    /// Heartbeat acknowledgment
    Pong,
    Error { message: String },
}

/// Result of decoding one text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ChannelEvent),
    /// Well-formed envelope of a type this client does not handle
    Unknown(String),
}

impl ChannelEvent {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Inbound> {
        let envelope: Envelope = serde_json::from_str(text)?;

        let event = match envelope.kind.as_str() {
            "connected" => ChannelEvent::Connected(envelope.data),
            "camera_status" => ChannelEvent::CameraStatus(serde_json::from_value(envelope.data)?),
            "stream_health" => ChannelEvent::StreamHealth(serde_json::from_value(envelope.data)?),
            "pong" => ChannelEvent::Pong,
            "error" => {
                let payload: ErrorPayload = match envelope.data {
                    Value::String(message) => ErrorPayload { message },
                    Value::Null => ErrorPayload {
                        message: String::new(),
                    },
                    other => serde_json::from_value(other)?,
                };
                ChannelEvent::Error {
                    message: payload.message,
                }
            }
            _ => return Ok(Inbound::Unknown(envelope.kind)),
        };

        Ok(Inbound::Event(event))
    }

    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            ChannelEvent::Connected(_) => "connected",
            ChannelEvent::CameraStatus(_) => "camera_status",
            ChannelEvent::StreamHealth(_) => "stream_health",
            ChannelEvent::Pong => "pong",
            ChannelEvent::Error { .. } => "error",
        }
    }
}

/// Encode an outbound envelope
pub fn encode(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera_status() {
        let inbound = ChannelEvent::parse(
            r#"{"type":"camera_status","data":{"id":"cam-7","status":"OFFLINE"}}"#,
        )
        .unwrap();

        assert_eq!(
            inbound,
            Inbound::Event(ChannelEvent::CameraStatus(CameraStatus {
                id: "cam-7".to_string(),
                status: "OFFLINE".to_string(),
                last_seen: None,
            }))
        );
    }

    #[test]
    fn test_parse_stream_health() {
        let inbound = ChannelEvent::parse(
            r#"{"type":"stream_health","data":{"id":"cam-2","name":"Gate","status":"restart_failed","message":"ffmpeg exited"}}"#,
        )
        .unwrap();

        match inbound {
            Inbound::Event(ChannelEvent::StreamHealth(health)) => {
                assert_eq!(health.status, StreamHealthStatus::RestartFailed);
                assert_eq!(health.name, "Gate");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let inbound = ChannelEvent::parse(r#"{"type":"viewer_count","data":3}"#).unwrap();
        assert_eq!(inbound, Inbound::Unknown("viewer_count".to_string()));

        let inbound = ChannelEvent::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(inbound, Inbound::Event(ChannelEvent::Pong));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(ChannelEvent::parse("not json").is_err());
        assert!(ChannelEvent::parse(r#"{"data":{}}"#).is_err());
        assert!(
            ChannelEvent::parse(r#"{"type":"stream_health","data":{"id":"x","status":"melted"}}"#)
                .is_err()
        );
    }

    #[test]
    fn test_error_payload_forms() {
        let inbound = ChannelEvent::parse(r#"{"type":"error","data":"bad token"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Event(ChannelEvent::Error {
                message: "bad token".to_string()
            })
        );

        let inbound =
            ChannelEvent::parse(r#"{"type":"error","data":{"message":"rate limited"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Event(ChannelEvent::Error {
                message: "rate limited".to_string()
            })
        );
    }

    #[test]
    fn test_encode_ping() {
        let value: Value = serde_json::from_str(&encode("ping", json!({}))).unwrap();
        assert_eq!(value, json!({"type": "ping", "data": {}}));
    }
}
