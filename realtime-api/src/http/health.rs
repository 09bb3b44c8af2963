//! Health check endpoint
//!
//! Reports broker state alongside connection counts; always 200 while the
//! process serves, since a degraded broker does not stop the relay.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use realtime_cluster::BrokerState;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker: BrokerState,
    pub namespaces: usize,
    pub connections: usize,
}

/// Underscore keeps it clear of tenant namespaces, which are hostnames
pub const HEALTH_PATH: &str = "/_health";

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker = *state.broker_state.borrow();

    Json(HealthResponse {
        status: "ok",
        broker,
        namespaces: state.hub.namespace_count(),
        connections: state.hub.connection_count(),
    })
}
