//! Prometheus metrics endpoint.

use crate::server::{RelayMetrics, RelayState};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(state): Extension<RelayState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(state.metrics()),
    )
}

fn render(m: &RelayMetrics) -> String {
    let series: [(&str, &str, &str, u64); 13] = [
        ("registered", "gauge", "Currently registered addresses", RelayMetrics::get(&m.registered)),
        ("pending", "gauge", "Handshakes in progress", RelayMetrics::get(&m.pending)),
        ("frames_received_total", "counter", "Frames read from clients", RelayMetrics::get(&m.frames_received)),
        ("malformed_total", "counter", "Frames that failed to decode", RelayMetrics::get(&m.malformed)),
        ("denied_total", "counter", "Frames rejected by permission lists", RelayMetrics::get(&m.denied)),
        ("rate_limited_total", "counter", "Frames over a connection window", RelayMetrics::get(&m.rate_limited)),
        ("global_limited_total", "counter", "Frames dropped by the global ceiling", RelayMetrics::get(&m.global_limited)),
        ("registrations_total", "counter", "Successful registrations", RelayMetrics::get(&m.registrations)),
        ("delivered_total", "counter", "Payloads delivered to local recipients", RelayMetrics::get(&m.delivered)),
        ("buffered_total", "counter", "Payloads buffered for absent recipients", RelayMetrics::get(&m.buffered)),
        ("overlay_published_total", "counter", "Messages published to the overlay", RelayMetrics::get(&m.overlay_published)),
        ("overlay_received_total", "counter", "Messages received from the overlay", RelayMetrics::get(&m.overlay_received)),
        ("evictions_total", "counter", "Registered connections closed by the relay", RelayMetrics::get(&m.evictions)),
    ];

    let mut body = format!(
        "# HELP waypost_relay_info Server information\n\
         # TYPE waypost_relay_info gauge\n\
         waypost_relay_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );
    for (name, kind, help, value) in series {
        let _ = write!(
            body,
            "\n# HELP waypost_relay_{name} {help}\n# TYPE waypost_relay_{name} {kind}\nwaypost_relay_{name} {value}\n"
        );
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn prometheus_format_is_valid() {
        let metrics = RelayMetrics::default();
        metrics.registered.store(42, Ordering::Relaxed);
        metrics.delivered.fetch_add(7, Ordering::Relaxed);

        let body = render(&metrics);

        assert!(body.contains("# TYPE waypost_relay_registered gauge\nwaypost_relay_registered 42"));
        assert!(body.contains("# TYPE waypost_relay_delivered_total counter\nwaypost_relay_delivered_total 7"));
        assert!(body.contains("waypost_relay_evictions_total 0"));
    }
}
