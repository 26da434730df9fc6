//! The envelope: the only unit ever sent on the wire.

use super::messages::Payload;
use serde::{Deserialize, Serialize};

/// Kind of an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Also decoded from any type this side does not know.
    #[default]
    #[serde(rename = "UNKNOWN", other)]
    Unknown,
    Request,
    Response,
    Event,
}

/// Message wrapper carrying sequence, kind, error and typed payload.
///
/// Requests and events are numbered independently. A response reuses the
/// sequence number of the request it answers, and a non-empty `error` means
/// its payload is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn request(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            message_type: MessageType::Request,
            error: String::new(),
            payload: Some(payload),
        }
    }

    pub fn response(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            message_type: MessageType::Response,
            error: String::new(),
            payload: Some(payload),
        }
    }

    /// Error-only response; an empty message is replaced so the error stays visible.
    pub fn error_response(sequence: u64, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            sequence,
            message_type: MessageType::Response,
            error,
            payload: None,
        }
    }

    pub fn event(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            message_type: MessageType::Event,
            error: String::new(),
            payload: Some(payload),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        format!(
            "{:?}#{} {}{}",
            self.message_type,
            self.sequence,
            self.payload.as_ref().map(|p| p.kind()).unwrap_or("-"),
            if self.is_error() {
                format!(" error={}", self.error)
            } else {
                String::new()
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Ping;

    #[test]
    fn test_error_response_has_no_payload() {
        let env = Envelope::error_response(7, "boom");
        assert_eq!(env.sequence, 7);
        assert_eq!(env.message_type, MessageType::Response);
        assert!(env.is_error());
        assert!(env.payload.is_none());
    }

    #[test]
    fn test_empty_error_message_is_kept_visible() {
        let env = Envelope::error_response(1, "");
        assert!(env.is_error());
    }

    #[test]
    fn test_json_field_names() {
        let env = Envelope::event(3, Payload::Ping(Ping::default()));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "Event");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["error"], "");
    }

    #[test]
    fn test_json_missing_optional_fields() {
        let env: Envelope = serde_json::from_str(r#"{"sequence":1,"type":"UNKNOWN"}"#).unwrap();
        assert_eq!(env.message_type, MessageType::Unknown);
        assert!(env.payload.is_none());
        assert!(!env.is_error());
    }
}
