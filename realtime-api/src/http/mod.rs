// Module: http
// Health endpoint and the per-namespace WebSocket gateway

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use realtime_cluster::sync::{BrokerState, NamespaceHub, PublishRequest};

use crate::auth::Authenticator;
use crate::handlers::HandlerRegistry;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<NamespaceHub>,
    pub registry: Arc<HandlerRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Absent when no broker is configured
    pub publish_tx: Option<mpsc::Sender<PublishRequest>>,
    pub broker_state: watch::Receiver<BrokerState>,
    pub editor_channel: String,
    pub max_message_size: usize,
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .merge(health::create_health_router())
        // Any namespace is routable; the authenticator validates it
        .route("/{namespace}", get(websocket::websocket_handler));

    // Origin is mirrored here and enforced during authentication
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, MockAuthenticator};
    use crate::handlers::StaticHandlerSource;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn state(authenticator: MockAuthenticator, broker: BrokerState) -> AppState {
        let (_tx, broker_state) = watch::channel(broker);
        AppState {
            hub: Arc::new(NamespaceHub::new()),
            registry: Arc::new(HandlerRegistry::new(Arc::new(StaticHandlerSource::new()))),
            authenticator: Arc::new(authenticator),
            publish_tx: None,
            broker_state,
            editor_channel: "open_in_editor".to_string(),
            max_message_size: 64 * 1024,
        }
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "acme.localhost")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_broker_state() {
        let app = create_router(state(MockAuthenticator::new(), BrokerState::Degraded));

        let response = app
            .oneshot(Request::builder().uri(health::HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "ok", "broker": "degraded", "namespaces": 0, "connections": 0})
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_not_upgraded() {
        let mut authenticator = MockAuthenticator::new();
        authenticator
            .expect_authenticate()
            .withf(|request| request.namespace == "acme.localhost" && request.sid.as_deref() == Some("abc"))
            .times(1)
            .returning(|_| Err(AuthError::InvalidOrigin));

        let app = create_router(state(authenticator, BrokerState::Subscribed));
        let mut request = upgrade_request("/acme.localhost");
        request
            .headers_mut()
            .insert(header::COOKIE, "sid=abc".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_health_is_a_valid_namespace() {
        let mut authenticator = MockAuthenticator::new();
        authenticator
            .expect_authenticate()
            .withf(|request| request.namespace == "health")
            .times(1)
            .returning(|_| Err(AuthError::MissingCredentials));

        let app = create_router(state(authenticator, BrokerState::Subscribed));
        let response = app.oneshot(upgrade_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
