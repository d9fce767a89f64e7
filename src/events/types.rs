//! Session event types
//!
//! Defines the notifications a stream session broadcasts to its host.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::playback::Anomaly;

/// Why a session reported an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ErrorReason {
    /// Neither a segmented decoder nor native playback is available
    NotSupported,
    /// No liveness event for the whole freshness window
    Timeout,
    /// The recovery ladder ran out of attempts
    RecoveryExhausted,
    /// Fatal decoder error with no applicable recovery
    Fatal(String),
}

impl ErrorReason {
    /// Terminal errors destroy the session; the caller must `load` or
    /// `force_reload` to bring it back.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ErrorReason::RecoveryExhausted)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::NotSupported => write!(f, "not supported"),
            ErrorReason::Timeout => write!(f, "timeout"),
            ErrorReason::RecoveryExhausted => {
                write!(f, "recovery failed after multiple attempts")
            }
            ErrorReason::Fatal(detail) => write!(f, "{}", detail),
        }
    }
}

/// What happened to a session
///
/// Serialized as `{"event": "session.freeze", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEventKind {
    /// A freeze or stall was detected; recovery follows
    #[serde(rename = "session.freeze")]
    Freeze { anomaly: Anomaly },

    /// A re-attaching recovery action completed
    #[serde(rename = "session.recover")]
    Recover,

    /// Exhausted recovery or a terminal failure
    #[serde(rename = "session.error")]
    Error { reason: ErrorReason },
}

/// Event published by a stream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session (camera) identifier
    pub session_id: String,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn is_error(&self) -> bool {
        matches!(self.kind, SessionEventKind::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(ErrorReason::NotSupported.to_string(), "not supported");
        assert_eq!(ErrorReason::Timeout.to_string(), "timeout");
        assert_eq!(
            ErrorReason::RecoveryExhausted.to_string(),
            "recovery failed after multiple attempts"
        );
        assert!(!ErrorReason::RecoveryExhausted.is_terminal());
        assert!(ErrorReason::Timeout.is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent {
            session_id: "cam-1".to_string(),
            kind: SessionEventKind::Error {
                reason: ErrorReason::Timeout,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["event"], "session.error");
        assert_eq!(json["kind"]["data"]["reason"]["reason"], "timeout");
    }
}
