use std::sync::Arc;
use tracing::{debug, warn};

use super::events::RelayMessage;
use super::namespace_hub::NamespaceHub;

/// Routes broker messages to connected clients
///
/// Room-targeted messages go to `{namespace, room}` only; messages without a
/// room go to every namespace. Delivery is fire-and-forget.
#[derive(Clone)]
pub struct EventRouter {
    hub: Arc<NamespaceHub>,
}

impl EventRouter {
    pub fn new(hub: Arc<NamespaceHub>) -> Self {
        Self { hub }
    }

    /// Deliver a parsed message. Returns the number of connections reached.
    pub fn dispatch(&self, message: &RelayMessage) -> usize {
        let event = message.to_socket_event();

        match message.target_room() {
            Some(room) => {
                if message.namespace.is_empty() {
                    warn!(
                        room = %room,
                        event = %message.event,
                        "Dropping room message without namespace"
                    );
                    return 0;
                }
                let namespace = message.namespace();
                let sent = self.hub.emit_to_room(&namespace, &room, &event);
                debug!(
                    namespace = %namespace,
                    room = %room,
                    event = %message.event,
                    sent = sent,
                    "Routed event to room"
                );
                sent
            }
            None => {
                let sent = self.hub.broadcast_all(&event);
                debug!(
                    event = %message.event,
                    sent = sent,
                    "Routed event to all namespaces"
                );
                sent
            }
        }
    }

    /// Parse and deliver a raw broker payload
    ///
    /// Malformed payloads are logged and dropped; returns `None` for them.
    pub fn dispatch_payload(&self, channel: &str, payload: &str) -> Option<usize> {
        match RelayMessage::from_payload(payload) {
            Ok(message) => Some(self.dispatch(&message)),
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %channel,
                    payload = %payload,
                    "Dropping malformed broker payload"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SocketEvent;
    use realtime_core::models::{ConnectionId, Namespace, RoomName};
    use serde_json::json;
    use std::time::Duration;
    use crate::sync::MessageReceiver;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from_string(id.to_string())
    }

    async fn next(rx: &mut MessageReceiver) -> Option<SocketEvent> {
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_room_scenario() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());

        let mut member = hub.subscribe(Namespace::from("acme"), conn("c1"), None);
        let mut bystander = hub.subscribe(Namespace::from("acme"), conn("c2"), None);
        hub.join_room(&conn("c1"), RoomName::from("docR"));

        let sent = router.dispatch_payload(
            "events",
            r#"{"namespace":"acme","room":"docR","event":"doc_updated","message":{"id":1}}"#,
        );

        assert_eq!(sent, Some(1));
        assert_eq!(
            next(&mut member).await,
            Some(SocketEvent::new("doc_updated", json!({"id": 1})))
        );
        assert_eq!(next(&mut bystander).await, None);
    }

    #[tokio::test]
    async fn test_roomless_scenario_reaches_every_namespace() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());

        let mut x = hub.subscribe(Namespace::from("x"), conn("c1"), None);
        let mut acme = hub.subscribe(Namespace::from("acme"), conn("c2"), None);

        let sent = router.dispatch_payload(
            "events",
            r#"{"namespace":"x","event":"build_done","message":"ok"}"#,
        );

        assert_eq!(sent, Some(2));
        let expected = SocketEvent::new("build_done", json!("ok"));
        assert_eq!(next(&mut x).await, Some(expected.clone()));
        assert_eq!(next(&mut acme).await, Some(expected));
        assert_eq!(next(&mut x).await, None);
    }

    #[tokio::test]
    async fn test_unknown_room_is_silently_dropped() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());
        let mut rx = hub.subscribe(Namespace::from("acme"), conn("c1"), None);

        let message = RelayMessage {
            namespace: "acme".to_string(),
            room: Some("nobody-here".to_string()),
            event: "ping".to_string(),
            message: json!(null),
        };

        assert_eq!(router.dispatch(&message), 0);
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_room_without_namespace_is_dropped() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());
        let mut rx = hub.subscribe(Namespace::from(""), conn("c1"), None);
        hub.join_room(&conn("c1"), RoomName::from("r"));

        let sent = router.dispatch_payload("events", r#"{"room":"r","event":"ping"}"#);

        assert_eq!(sent, Some(0));
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_slashed_namespace_targets_its_own_path() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());
        let mut rx = hub.subscribe(Namespace::from("acme"), conn("c1"), None);
        hub.join_room(&conn("c1"), RoomName::from("docR"));

        // Addresses "//acme", where nobody is connected
        let sent = router.dispatch_payload(
            "events",
            r#"{"namespace":"/acme","room":"docR","event":"doc_updated"}"#,
        );

        assert_eq!(sent, Some(0));
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let hub = Arc::new(NamespaceHub::new());
        let router = EventRouter::new(hub.clone());
        let mut rx = hub.subscribe(Namespace::from("acme"), conn("c1"), None);

        assert_eq!(router.dispatch_payload("events", "{not json"), None);
        assert_eq!(router.dispatch_payload("events", r#"{"namespace":"acme"}"#), None);
        assert_eq!(next(&mut rx).await, None);
        assert_eq!(hub.connection_count(), 1);
    }
}
