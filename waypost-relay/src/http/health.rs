//! Health check endpoint.

use crate::server::{RelayMetrics, RelayState};
use axum::{Extension, Json};
use serde::Serialize;

/// Snapshot returned by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Always `ok` while the HTTP server answers.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// This relay instance, as hex.
    pub instance_id: String,
    /// Registered addresses.
    pub registered: u64,
    /// Handshakes in progress.
    pub pending: u64,
    /// Payloads buffered since startup.
    pub buffered_total: u64,
    /// Seconds since the instance started.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Read the current state of a relay instance.
    pub fn of(state: &RelayState) -> Self {
        let metrics = state.metrics();
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            instance_id: state.instance_id().to_hex(),
            registered: RelayMetrics::get(&metrics.registered),
            pending: RelayMetrics::get(&metrics.pending),
            buffered_total: RelayMetrics::get(&metrics.buffered),
            uptime_seconds: state.uptime().as_secs(),
        }
    }
}

/// Health check handler.
pub async fn health_handler(Extension(state): Extension<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use waypost_types::Address;

    #[test]
    fn health_reflects_metrics() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(RelayMetrics::default());
        metrics.registered.store(42, Ordering::Relaxed);
        metrics.pending.store(3, Ordering::Relaxed);
        let state = RelayState::new(tx, metrics, Config::default(), Address::from([0xab; 16]));

        let json = serde_json::to_value(HealthStatus::of(&state)).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["instance_id"], "ab".repeat(16));
        assert_eq!(json["registered"], 42);
        assert_eq!(json["pending"], 3);
        assert_eq!(json["buffered_total"], 0);
    }
}
