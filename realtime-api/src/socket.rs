//! Per-connection socket handle given to tenant handlers

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use realtime_cluster::sync::{NamespaceHub, SocketEvent};
use realtime_core::models::{ConnectionId, Namespace, RoomName};

use crate::auth::AuthContext;

pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Event dispatched by the gateway when the client goes away
///
/// Listeners run while the socket is still in its rooms. Clients cannot send
/// this event themselves.
pub const DISCONNECT_EVENT: &str = "disconnect";

type EventListener = Arc<dyn Fn(Socket, Value) -> ListenerFuture + Send + Sync>;

/// Cheaply cloneable handle to one client connection
///
/// Room membership lives in the [`NamespaceHub`]; the socket only records its
/// own event listeners.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: ConnectionId,
    namespace: Namespace,
    auth: AuthContext,
    hub: Arc<NamespaceHub>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
}

impl Socket {
    pub fn new(id: ConnectionId, namespace: Namespace, auth: AuthContext, hub: Arc<NamespaceHub>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                namespace,
                auth,
                hub,
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    #[must_use]
    pub fn auth(&self) -> &AuthContext {
        &self.inner.auth
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.inner.auth.user
    }

    /// Register a listener for a client event
    ///
    /// Listeners for the same event run in registration order.
    pub fn on<F, Fut>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(Self, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: EventListener = Arc::new(move |socket, data| Box::pin(listener(socket, data)));
        self.inner
            .listeners
            .write()
            .entry(event.into())
            .or_default()
            .push(listener);
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Drop every listener
    pub fn clear_listeners(&self) {
        self.inner.listeners.write().clear();
    }

    /// Run the `disconnect` listeners, then drop every listener
    ///
    /// Must be called before the connection leaves the hub.
    pub async fn disconnect(&self) {
        self.dispatch(SocketEvent::new(DISCONNECT_EVENT, Value::Null))
            .await;
        self.clear_listeners();
    }

    pub fn join(&self, room: impl Into<RoomName>) -> bool {
        self.inner.hub.join_room(&self.inner.id, room.into())
    }

    pub fn leave(&self, room: &RoomName) -> bool {
        self.inner.hub.leave_room(&self.inner.id, room)
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<RoomName> {
        self.inner.hub.rooms_of(&self.inner.id)
    }

    /// Send an event to this connection only
    pub fn emit(&self, event: impl Into<String>, data: Value) -> bool {
        self.inner
            .hub
            .emit_to_connection(&self.inner.id, SocketEvent::new(event, data))
    }

    /// Send an event to every member of a room in this socket's namespace
    pub fn emit_to_room(&self, room: &RoomName, event: impl Into<String>, data: Value) -> usize {
        self.inner
            .hub
            .emit_to_room(&self.inner.namespace, room, &SocketEvent::new(event, data))
    }

    /// Distinct users in a room of this socket's namespace, sorted
    #[must_use]
    pub fn room_users(&self, room: &RoomName) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .hub
            .room_members(&self.inner.namespace, room)
            .into_iter()
            .filter_map(|(_, user)| user)
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Run the listeners registered for an incoming event
    ///
    /// A panicking listener is logged and skipped; later listeners still run.
    /// Returns the number of listeners invoked.
    pub async fn dispatch(&self, event: SocketEvent) -> usize {
        let listeners = self
            .inner
            .listeners
            .read()
            .get(&event.event)
            .cloned()
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!(
                namespace = %self.inner.namespace,
                connection_id = %self.inner.id,
                event = %event.event,
                "No listener for client event"
            );
            return 0;
        }

        for listener in &listeners {
            let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener(self.clone(), event.data.clone())
            })) {
                Ok(future) => future,
                Err(_) => {
                    warn!(
                        namespace = %self.inner.namespace,
                        connection_id = %self.inner.id,
                        event = %event.event,
                        "Event listener panicked"
                    );
                    continue;
                }
            };

            if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                warn!(
                    namespace = %self.inner.namespace,
                    connection_id = %self.inner.id,
                    event = %event.event,
                    "Event listener panicked"
                );
            }
        }

        listeners.len()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.namespace)
            .field("user", &self.inner.auth.user)
            .finish_non_exhaustive()
    }
}
