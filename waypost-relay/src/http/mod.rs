//! HTTP endpoints for waypost-relay.
//!
//! `GET /` upgrades to the binary WebSocket protocol. Health and metrics
//! sit beside it.

pub mod health;
mod metrics;

use crate::server::RelayState;
use crate::transport::ws::serve_socket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::{routing::get, Extension, Router};

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(state: RelayState) -> Router {
    let mut router = Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health::health_handler));
    if state.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(state))
}

/// Upgrade to a relay WebSocket.
async fn ws_handler(ws: WebSocketUpgrade, Extension(state): Extension<RelayState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}
