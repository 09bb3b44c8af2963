//! WebSocket gateway
//!
//! One route per namespace (`/{namespace}`). The handshake is authenticated
//! before the upgrade; admitted sockets get their tenant handlers installed
//! and then exchange `{"event": .., "data": ..}` JSON text frames.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use realtime_cluster::sync::{PublishRequest, SocketEvent};
use realtime_core::models::{ConnectionId, Namespace};

use crate::auth::{AuthContext, AuthRequest};
use crate::http::{AppError, AppResult, AppState};
use crate::socket::{Socket, DISCONNECT_EVENT};

/// Client event republished on the editor channel
pub const OPEN_IN_EDITOR: &str = "open_in_editor";

/// Session cookie set by the backend
const SESSION_COOKIE: &str = "sid";

/// WebSocket handshake for a tenant namespace
///
/// Authentication runs first, so a rejected client gets its auth error even
/// when the request is not a valid upgrade.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let request = AuthRequest {
        namespace: namespace.clone(),
        host: header_value(&headers, header::HOST),
        origin: header_value(&headers, header::ORIGIN),
        sid: jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string()),
        authorization: header_value(&headers, header::AUTHORIZATION),
    };

    let auth = state
        .authenticator
        .authenticate(&request)
        .await
        .map_err(|e| {
            warn!(namespace = %namespace, error = %e, "Rejected handshake");
            AppError::from(e)
        })?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let namespace = Namespace::new(namespace);
    Ok(ws
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, namespace, auth)))
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_socket(ws: WebSocket, state: AppState, namespace: Namespace, auth: AuthContext) {
    let connection_id = ConnectionId::new();
    let user = auth.user.clone();

    let mut events_rx = state
        .hub
        .subscribe(namespace.clone(), connection_id.clone(), Some(user.clone()));
    let socket = Socket::new(connection_id.clone(), namespace.clone(), auth, state.hub.clone());

    let installed = state
        .registry
        .install_all(&socket, &socket.auth().installed_apps);
    install_editor_listener(&socket, &state);

    info!(
        namespace = %namespace,
        connection_id = %connection_id,
        user = %user,
        handlers = installed,
        "WebSocket connection established"
    );

    let (mut sink, mut stream) = ws.split();

    // Hub -> client. Ends once the hub drops this connection's sender.
    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_connection, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_connection, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Client -> listeners, in arrival order
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SocketEvent>(text.as_str()) {
                Ok(event) if event.event == DISCONNECT_EVENT => {
                    debug!(connection_id = %connection_id, "Ignoring reserved client event");
                }
                Ok(event) => {
                    socket.dispatch(event).await;
                }
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        connection_id = %connection_id,
                        error = %e,
                        "Ignoring malformed client frame"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    // Disconnect listeners still see the connection's rooms
    socket.disconnect().await;
    state.hub.unsubscribe(&connection_id);
    if writer.await.is_err() {
        debug!(connection_id = %connection_id, "Writer task ended abnormally");
    }

    info!(
        namespace = %namespace,
        connection_id = %connection_id,
        user = %user,
        "WebSocket connection closed"
    );
}

/// Forward `open_in_editor` payloads to the developer tooling channel
fn install_editor_listener(socket: &Socket, state: &AppState) {
    let publish_tx = state.publish_tx.clone();
    let channel = state.editor_channel.clone();

    socket.on(OPEN_IN_EDITOR, move |socket, data| {
        let publish_tx = publish_tx.clone();
        let channel = channel.clone();
        async move {
            let Some(publish_tx) = publish_tx else {
                debug!(connection_id = %socket.id(), "No broker configured, dropping open_in_editor");
                return;
            };
            let request = PublishRequest {
                channel,
                payload: data.to_string(),
            };
            if let Err(e) = publish_tx.try_send(request) {
                warn!(connection_id = %socket.id(), error = %e, "Failed to queue open_in_editor");
            }
        }
    });
}
