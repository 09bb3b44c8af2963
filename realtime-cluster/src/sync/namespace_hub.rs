use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use realtime_core::models::{ConnectionId, Namespace, RoomName};

use super::events::SocketEvent;

/// Outgoing event queue of one client connection
pub type MessageSender = mpsc::Sender<SocketEvent>;

/// Receiving end of [`MessageSender`], drained by the connection's writer
pub type MessageReceiver = mpsc::Receiver<SocketEvent>;

/// Events buffered per connection before new ones are dropped
pub const CLIENT_QUEUE_CAPACITY: usize = 1024;

/// Outcome of handing an event to one connection's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Queue full, the event is dropped for this client only
    Dropped,
    Closed,
}

/// Subscriber information
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub user: Option<String>,
    pub sender: MessageSender,
}

/// Connections and rooms of one namespace
#[derive(Debug, Default)]
struct NamespaceEntry {
    subscribers: HashMap<ConnectionId, Subscriber>,
    rooms: HashMap<RoomName, HashSet<ConnectionId>>,
}

impl NamespaceEntry {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn remove_from_room(&mut self, room: &RoomName, connection_id: &ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(connection_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }
}

/// In-memory table routing events to connected clients by namespace and room
///
/// A namespace entry is created by its first connection and removed when its
/// last connection leaves.
#[derive(Clone)]
pub struct NamespaceHub {
    /// Map of namespace -> its connections and rooms
    namespaces: Arc<DashMap<Namespace, NamespaceEntry>>,

    /// Map of connection_id -> namespace for cleanup
    connections: Arc<DashMap<ConnectionId, Namespace>>,

    queue_capacity: usize,
}

impl NamespaceHub {
    pub fn new() -> Self {
        Self::with_queue_capacity(CLIENT_QUEUE_CAPACITY)
    }

    /// Hub whose per-connection queues hold at most `capacity` events
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            namespaces: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            queue_capacity: capacity.max(1),
        }
    }

    /// Add a connection to a namespace
    /// Returns a receiver for events addressed to it
    pub fn subscribe(
        &self,
        namespace: Namespace,
        connection_id: ConnectionId,
        user: Option<String>,
    ) -> MessageReceiver {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let subscriber = Subscriber {
            connection_id: connection_id.clone(),
            user: user.clone(),
            sender: tx,
        };

        self.namespaces
            .entry(namespace.clone())
            .or_default()
            .subscribers
            .insert(connection_id.clone(), subscriber);

        self.connections
            .insert(connection_id.clone(), namespace.clone());

        info!(
            namespace = %namespace,
            user = user.as_deref().unwrap_or("-"),
            connection_id = %connection_id,
            "Client subscribed to namespace"
        );

        rx
    }

    /// Remove a connection from its namespace and every room it joined
    pub fn unsubscribe(&self, connection_id: &ConnectionId) {
        let Some((_, namespace)) = self.connections.remove(connection_id) else {
            warn!(
                connection_id = %connection_id,
                "Attempted to unsubscribe unknown connection"
            );
            return;
        };

        if let Some(mut entry) = self.namespaces.get_mut(&namespace) {
            entry.subscribers.remove(connection_id);
            entry.rooms.retain(|_, members| {
                members.remove(connection_id);
                !members.is_empty()
            });
        }

        if self
            .namespaces
            .remove_if(&namespace, |_, entry| entry.is_empty())
            .is_some()
        {
            debug!(namespace = %namespace, "Namespace has no more connections, removed");
        }

        info!(
            namespace = %namespace,
            connection_id = %connection_id,
            "Client unsubscribed from namespace"
        );
    }

    /// Add a connection to a room of its namespace
    ///
    /// Returns false for unknown connections.
    pub fn join_room(&self, connection_id: &ConnectionId, room: RoomName) -> bool {
        let Some(namespace) = self.namespace_of(connection_id) else {
            return false;
        };

        let Some(mut entry) = self.namespaces.get_mut(&namespace) else {
            return false;
        };
        let joined = entry
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id.clone());

        if joined {
            debug!(
                namespace = %namespace,
                room = %room,
                connection_id = %connection_id,
                "Connection joined room"
            );
        }

        true
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub fn leave_room(&self, connection_id: &ConnectionId, room: &RoomName) -> bool {
        let Some(namespace) = self.namespace_of(connection_id) else {
            return false;
        };

        let left = self
            .namespaces
            .get_mut(&namespace)
            .is_some_and(|mut entry| entry.remove_from_room(room, connection_id));

        if left {
            debug!(
                namespace = %namespace,
                room = %room,
                connection_id = %connection_id,
                "Connection left room"
            );
        }

        left
    }

    /// Emit an event to every connection in one room of one namespace
    pub fn emit_to_room(&self, namespace: &Namespace, room: &RoomName, event: &SocketEvent) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(entry) = self.namespaces.get(namespace) {
            if let Some(members) = entry.rooms.get(room) {
                for subscriber in members.iter().filter_map(|id| entry.subscribers.get(id)) {
                    match Self::deliver(namespace, subscriber, event) {
                        Delivery::Sent => sent_count += 1,
                        Delivery::Dropped => {}
                        Delivery::Closed => failed_connections.push(subscriber.connection_id.clone()),
                    }
                }
            }
        }

        self.cleanup(failed_connections);

        debug!(
            namespace = %namespace,
            room = %room,
            event = %event.event_type(),
            sent_count = sent_count,
            "Room emit complete"
        );

        sent_count
    }

    /// Emit an event to every connection of one namespace
    pub fn emit_to_namespace(&self, namespace: &Namespace, event: &SocketEvent) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(entry) = self.namespaces.get(namespace) {
            for subscriber in entry.subscribers.values() {
                match Self::deliver(namespace, subscriber, event) {
                    Delivery::Sent => sent_count += 1,
                    Delivery::Dropped => {}
                    Delivery::Closed => failed_connections.push(subscriber.connection_id.clone()),
                }
            }
        }

        self.cleanup(failed_connections);

        sent_count
    }

    /// Emit an event to every connection of every namespace, once each
    pub fn broadcast_all(&self, event: &SocketEvent) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        for entry in self.namespaces.iter() {
            for subscriber in entry.value().subscribers.values() {
                match Self::deliver(entry.key(), subscriber, event) {
                    Delivery::Sent => sent_count += 1,
                    Delivery::Dropped => {}
                    Delivery::Closed => failed_connections.push(subscriber.connection_id.clone()),
                }
            }
        }

        self.cleanup(failed_connections);

        debug!(
            event = %event.event_type(),
            sent_count = sent_count,
            "Broadcast to all namespaces complete"
        );

        sent_count
    }

    /// Emit an event to a single connection
    pub fn emit_to_connection(&self, connection_id: &ConnectionId, event: SocketEvent) -> bool {
        let Some(namespace) = self.namespace_of(connection_id) else {
            return false;
        };

        let delivery = self
            .namespaces
            .get(&namespace)
            .and_then(|entry| {
                entry
                    .subscribers
                    .get(connection_id)
                    .map(|subscriber| Self::deliver(&namespace, subscriber, &event))
            })
            .unwrap_or(Delivery::Closed);

        if delivery == Delivery::Closed {
            self.cleanup(vec![connection_id.clone()]);
        }

        delivery == Delivery::Sent
    }

    fn deliver(namespace: &Namespace, subscriber: &Subscriber, event: &SocketEvent) -> Delivery {
        match subscriber.sender.try_send(event.clone()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                warn!(
                    namespace = %namespace,
                    connection_id = %subscriber.connection_id,
                    event = %event.event_type(),
                    "Client too slow to consume events, dropping event"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    namespace = %namespace,
                    connection_id = %subscriber.connection_id,
                    "Client queue closed, marking for cleanup"
                );
                Delivery::Closed
            }
        }
    }

    fn cleanup(&self, failed_connections: Vec<ConnectionId>) {
        for connection_id in failed_connections {
            if self.connections.contains_key(&connection_id) {
                self.unsubscribe(&connection_id);
            }
        }
    }

    /// Namespace a connection belongs to
    pub fn namespace_of(&self, connection_id: &ConnectionId) -> Option<Namespace> {
        self.connections
            .get(connection_id)
            .map(|namespace| namespace.clone())
    }

    /// Rooms a connection has joined
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomName> {
        let Some(namespace) = self.namespace_of(connection_id) else {
            return Vec::new();
        };

        let mut rooms: Vec<RoomName> = self
            .namespaces
            .get(&namespace)
            .map(|entry| {
                entry
                    .rooms
                    .iter()
                    .filter(|(_, members)| members.contains(connection_id))
                    .map(|(room, _)| room.clone())
                    .collect()
            })
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Members of a room with their authenticated user, if any
    pub fn room_members(&self, namespace: &Namespace, room: &RoomName) -> Vec<(ConnectionId, Option<String>)> {
        self.namespaces
            .get(namespace)
            .map(|entry| {
                entry
                    .rooms
                    .get(room)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| entry.subscribers.get(id))
                    .map(|sub| (sub.connection_id.clone(), sub.user.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the number of connections in a namespace
    pub fn subscriber_count(&self, namespace: &Namespace) -> usize {
        self.namespaces
            .get(namespace)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Get the number of non-empty rooms in a namespace
    pub fn room_count(&self, namespace: &Namespace) -> usize {
        self.namespaces
            .get(namespace)
            .map_or(0, |entry| entry.rooms.len())
    }

    /// Get the number of active namespaces
    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    /// Get total number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for NamespaceHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from_string(id.to_string())
    }

    async fn assert_silent(rx: &mut MessageReceiver) {
        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(received.is_err(), "connection should not have received an event");
    }

    #[tokio::test]
    async fn test_subscribe_and_emit_to_namespace() {
        let hub = NamespaceHub::new();
        let ns = Namespace::from("acme");

        let mut rx = hub.subscribe(ns.clone(), conn("c1"), Some("a@acme.com".to_string()));

        assert_eq!(hub.subscriber_count(&ns), 1);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.namespace_count(), 1);

        let sent = hub.emit_to_namespace(&ns, &SocketEvent::new("hello", json!(1)));
        assert_eq!(sent, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "hello");
    }

    #[tokio::test]
    async fn test_room_emit_only_reaches_members() {
        let hub = NamespaceHub::new();
        let acme = Namespace::from("acme");
        let other = Namespace::from("other");
        let room = RoomName::from("docR");

        let mut in_room = hub.subscribe(acme.clone(), conn("c1"), None);
        let mut not_in_room = hub.subscribe(acme.clone(), conn("c2"), None);
        let mut same_room_other_ns = hub.subscribe(other.clone(), conn("c3"), None);

        assert!(hub.join_room(&conn("c1"), room.clone()));
        assert!(hub.join_room(&conn("c3"), room.clone()));

        let event = SocketEvent::new("doc_updated", json!({"id": 1}));
        assert_eq!(hub.emit_to_room(&acme, &room, &event), 1);

        assert_eq!(in_room.recv().await.unwrap(), event);
        assert_silent(&mut not_in_room).await;
        assert_silent(&mut same_room_other_ns).await;
    }

    #[tokio::test]
    async fn test_broadcast_all_reaches_each_connection_once() {
        let hub = NamespaceHub::new();
        let mut rx1 = hub.subscribe(Namespace::from("a"), conn("c1"), None);
        let mut rx2 = hub.subscribe(Namespace::from("b"), conn("c2"), None);
        let mut rx3 = hub.subscribe(Namespace::from("b"), conn("c3"), None);
        hub.join_room(&conn("c2"), RoomName::from("r1"));
        hub.join_room(&conn("c2"), RoomName::from("r2"));

        let event = SocketEvent::new("build_done", json!("ok"));
        assert_eq!(hub.broadcast_all(&event), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(rx.recv().await.unwrap(), event);
            assert_silent(rx).await;
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_namespace_and_rooms() {
        let hub = NamespaceHub::new();
        let ns = Namespace::from("acme");

        let _rx1 = hub.subscribe(ns.clone(), conn("c1"), None);
        let _rx2 = hub.subscribe(ns.clone(), conn("c2"), None);
        hub.join_room(&conn("c1"), RoomName::from("docR"));
        assert_eq!(hub.room_count(&ns), 1);

        hub.unsubscribe(&conn("c1"));
        assert_eq!(hub.subscriber_count(&ns), 1);
        assert_eq!(hub.room_count(&ns), 0);
        assert_eq!(hub.namespace_count(), 1);

        hub.unsubscribe(&conn("c2"));
        assert_eq!(hub.namespace_count(), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_room() {
        let hub = NamespaceHub::new();
        let ns = Namespace::from("acme");
        let room = RoomName::from("docR");
        let mut rx = hub.subscribe(ns.clone(), conn("c1"), None);

        hub.join_room(&conn("c1"), room.clone());
        assert_eq!(hub.rooms_of(&conn("c1")), vec![room.clone()]);

        assert!(hub.leave_room(&conn("c1"), &room));
        assert!(!hub.leave_room(&conn("c1"), &room));
        assert!(hub.rooms_of(&conn("c1")).is_empty());

        assert_eq!(hub.emit_to_room(&ns, &room, &SocketEvent::new("x", json!(null))), 0);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unknown_connection_cannot_join() {
        let hub = NamespaceHub::new();
        assert!(!hub.join_room(&conn("ghost"), RoomName::from("r")));
        assert!(!hub.emit_to_connection(&conn("ghost"), SocketEvent::new("x", json!(null))));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let hub = NamespaceHub::new();
        let ns = Namespace::from("acme");

        let rx = hub.subscribe(ns.clone(), conn("c1"), None);
        drop(rx);

        assert_eq!(hub.emit_to_namespace(&ns, &SocketEvent::new("x", json!(null))), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.namespace_count(), 0);
    }

    #[tokio::test]
    async fn test_room_members_report_users() {
        let hub = NamespaceHub::new();
        let ns = Namespace::from("acme");
        let room = RoomName::from("open_doc:ToDo/TD-1");

        let _rx1 = hub.subscribe(ns.clone(), conn("c1"), Some("alice".to_string()));
        let _rx2 = hub.subscribe(ns.clone(), conn("c2"), None);
        hub.join_room(&conn("c1"), room.clone());

        let members = hub.room_members(&ns, &room);
        assert_eq!(members, vec![(conn("c1"), Some("alice".to_string()))]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events_but_keeps_connection() {
        let hub = NamespaceHub::with_queue_capacity(2);
        let ns = Namespace::from("acme");
        let mut stalled = hub.subscribe(ns.clone(), conn("c1"), None);
        let mut reading = hub.subscribe(Namespace::from("other"), conn("c2"), None);

        let sent: usize = (0..5)
            .map(|i| {
                let sent = hub.broadcast_all(&SocketEvent::new("tick", json!(i)));
                // Keep the second client drained
                while reading.try_recv().is_ok() {}
                sent
            })
            .sum();

        // c2 gets all five, c1 only until its queue filled up
        assert_eq!(sent, 7);
        assert_eq!(hub.connection_count(), 2);

        assert_eq!(stalled.recv().await.unwrap(), SocketEvent::new("tick", json!(0)));
        assert_eq!(stalled.recv().await.unwrap(), SocketEvent::new("tick", json!(1)));
        assert_silent(&mut stalled).await;

        // Room for new events again once the client catches up
        assert!(hub.emit_to_connection(&conn("c1"), SocketEvent::new("tick", json!(5))));
        assert_eq!(stalled.recv().await.unwrap(), SocketEvent::new("tick", json!(5)));
    }

    #[tokio::test]
    async fn test_full_queue_on_direct_emit_is_not_cleanup() {
        let hub = NamespaceHub::with_queue_capacity(1);
        let _rx = hub.subscribe(Namespace::from("acme"), conn("c1"), None);

        assert!(hub.emit_to_connection(&conn("c1"), SocketEvent::new("a", json!(null))));
        assert!(!hub.emit_to_connection(&conn("c1"), SocketEvent::new("b", json!(null))));
        assert_eq!(hub.connection_count(), 1);
    }
}
