use serde::{Deserialize, Serialize};
use serde_json::Value;

use realtime_core::models::{Namespace, RoomName};

/// Event published by the backend on the broker channel
///
/// Wire shape: `{"namespace": "acme", "room": "doc:ToDo/TD-1", "event": "doc_update", "message": {...}}`.
/// `room` may be absent, `null` or empty, all meaning "every namespace".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub event: String,
    #[serde(default)]
    pub message: Value,
}

impl RelayMessage {
    /// Parse a raw broker payload
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.as_str())
    }

    /// Target room, treating an empty string like no room at all
    #[must_use]
    pub fn target_room(&self) -> Option<RoomName> {
        self.room
            .as_deref()
            .filter(|room| !room.is_empty())
            .map(RoomName::from)
    }

    #[must_use]
    pub fn to_socket_event(&self) -> SocketEvent {
        SocketEvent::new(self.event.clone(), self.message.clone())
    }
}

/// A named event with one JSON payload, the frame exchanged with clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_room_message() {
        let msg = RelayMessage::from_payload(
            r#"{"namespace":"acme","room":"docR","event":"doc_updated","message":{"id":1}}"#,
        )
        .unwrap();

        assert_eq!(msg.namespace().path(), "/acme");
        assert_eq!(msg.target_room(), Some(RoomName::from("docR")));
        assert_eq!(msg.to_socket_event(), SocketEvent::new("doc_updated", json!({"id": 1})));
    }

    #[test]
    fn test_null_and_empty_room_mean_broadcast() {
        let null_room = RelayMessage::from_payload(
            r#"{"namespace":"x","room":null,"event":"build_done","message":"ok"}"#,
        )
        .unwrap();
        let empty_room =
            RelayMessage::from_payload(r#"{"namespace":"x","room":"","event":"build_done"}"#)
                .unwrap();

        assert_eq!(null_room.target_room(), None);
        assert_eq!(empty_room.target_room(), None);
        assert_eq!(empty_room.message, Value::Null);
    }

    #[test]
    fn test_malformed_payloads_are_errors() {
        assert!(RelayMessage::from_payload("not json").is_err());
        assert!(RelayMessage::from_payload(r#"{"namespace":"x"}"#).is_err());
        assert!(RelayMessage::from_payload(r#"["event"]"#).is_err());
    }

    #[test]
    fn test_socket_event_frame_shape() {
        let frame = serde_json::to_value(SocketEvent::new("build_done", json!("ok"))).unwrap();
        assert_eq!(frame, json!({"event": "build_done", "data": "ok"}));

        let parsed: SocketEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(parsed.data, Value::Null);
    }
}
