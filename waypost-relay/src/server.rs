//! Relay startup and shared state.
//!
//! [`Relay::start`] wires the pieces together: it validates configuration,
//! starts the worker pool, spawns the coordinator with its limiter tick and
//! cleanup task, and hands back a [`RelayHandle`]. Transports and HTTP
//! handlers only need the cheap, cloneable [`RelayState`].

use crate::cleanup::spawn_cleanup_task;
use crate::config::Config;
use crate::error::RelayError;
use crate::overlay::{Overlay, OverlayEvent};
use crate::proxy::{Proxy, RelayEvent};
use crate::transport::{ConnectionHandle, ConnectionId};
use crate::worker::{WorkerPool, WorkerSetup};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use waypost_core::{Clock, Processor, SystemClock};
use waypost_types::Address;

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart).
/// `registered` and `pending` are gauges refreshed by the coordinator.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Frames read from any connection.
    pub frames_received: AtomicU64,
    /// Frames that failed to decode.
    pub malformed: AtomicU64,
    /// Frames rejected by a permission filter.
    pub denied: AtomicU64,
    /// Frames that tripped a per-connection window.
    pub rate_limited: AtomicU64,
    /// Frames dropped by the global admission ceiling.
    pub global_limited: AtomicU64,
    /// Successful registrations.
    pub registrations: AtomicU64,
    /// Payloads written to a local recipient.
    pub delivered: AtomicU64,
    /// Payloads buffered for an absent recipient.
    pub buffered: AtomicU64,
    /// Messages handed to the overlay.
    pub overlay_published: AtomicU64,
    /// Messages received from the overlay.
    pub overlay_received: AtomicU64,
    /// Registered connections closed by the relay.
    pub evictions: AtomicU64,
    /// Currently registered addresses.
    pub registered: AtomicU64,
    /// Handshakes in progress.
    pub pending: AtomicU64,
}

impl RelayMetrics {
    /// Read a metric.
    pub fn get(metric: &AtomicU64) -> u64 {
        metric.load(Ordering::Relaxed)
    }
}

/// State shared with transports and HTTP handlers.
#[derive(Debug, Clone)]
pub struct RelayState {
    events: mpsc::UnboundedSender<RelayEvent>,
    metrics: Arc<RelayMetrics>,
    config: Arc<Config>,
    instance_id: Address,
    started: Instant,
}

impl RelayState {
    /// Bundle shared state.
    pub fn new(
        events: mpsc::UnboundedSender<RelayEvent>,
        metrics: Arc<RelayMetrics>,
        config: Config,
        instance_id: Address,
    ) -> Self {
        Self {
            events,
            metrics,
            config: Arc::new(config),
            instance_id,
            started: Instant::now(),
        }
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Random id of this relay instance.
    pub fn instance_id(&self) -> Address {
        self.instance_id
    }

    /// Time since the instance started.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hand an inbound frame to the coordinator.
    ///
    /// Returns `false` once the coordinator has stopped.
    pub fn frame(&self, conn: ConnectionHandle, bytes: Vec<u8>) -> bool {
        self.events.send(RelayEvent::Frame { conn, bytes }).is_ok()
    }

    /// Report a closed connection to the coordinator.
    pub fn closed(&self, conn_id: ConnectionId, code: u16, reason: &str) {
        let _ = self.events.send(RelayEvent::Closed {
            conn_id,
            code,
            reason: reason.to_string(),
        });
    }
}

/// Knobs that tests and embedders may override.
pub struct RelayOptions {
    /// Wall clock for activity and buffer timestamps.
    pub clock: Arc<dyn Clock>,
    /// Parallelism ceiling for the worker pool; detected when `None`.
    pub parallelism: Option<usize>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            parallelism: None,
        }
    }
}

/// Relay entry point.
#[derive(Debug)]
pub struct Relay;

impl Relay {
    /// Start a relay instance on the current tokio runtime.
    pub fn start(
        config: Config,
        overlay: Arc<dyn Overlay>,
        overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
    ) -> Result<RelayHandle, RelayError> {
        Self::start_with(config, overlay, overlay_events, RelayOptions::default())
    }

    /// Start a relay instance with explicit options.
    pub fn start_with(
        config: Config,
        overlay: Arc<dyn Overlay>,
        overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
        options: RelayOptions,
    ) -> Result<RelayHandle, RelayError> {
        config.validate()?;
        let difficulty = config.auth.difficulty_mask()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let processed = tx.clone();
        let forwarded = tx.clone();
        let setup = WorkerSetup {
            processors: config.workers.processors,
            overlays: config.workers.overlays,
            processor: Arc::new(Processor::new(difficulty)),
            overlay,
            overlay_events,
            on_processed: Arc::new(move |output| {
                let _ = processed.send(RelayEvent::Processor(output));
            }),
            on_overlay_event: Arc::new(move |event| {
                let _ = forwarded.send(RelayEvent::Overlay(event));
            }),
        };
        let pool = match options.parallelism {
            Some(available) => WorkerPool::start_with_parallelism(setup, available)?,
            None => WorkerPool::start(setup)?,
        };

        let instance_id = Address::random();
        let metrics = Arc::new(RelayMetrics::default());
        let proxy = Proxy::new(
            &config,
            instance_id,
            pool,
            tx.clone(),
            metrics.clone(),
            options.clock,
        );

        let ticker = proxy.spawn_limiter_ticker();
        let cleanup = spawn_cleanup_task(tx.clone(), config.cleanup.clone());
        let coordinator = tokio::spawn(proxy.run(rx));

        tracing::info!("Relay instance {} started", instance_id);

        Ok(RelayHandle {
            state: RelayState::new(tx, metrics, config, instance_id),
            coordinator,
            background: vec![ticker, cleanup],
        })
    }
}

/// A running relay instance.
#[derive(Debug)]
pub struct RelayHandle {
    state: RelayState,
    coordinator: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Shared state for transports and HTTP handlers.
    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    /// Stop the coordinator, kill the worker pool and close every
    /// connection.
    pub async fn shutdown(self) {
        let _ = self.state.events.send(RelayEvent::Shutdown);
        for task in &self.background {
            task.abort();
        }
        if let Err(e) = self.coordinator.await {
            tracing::error!("Coordinator task failed: {}", e);
        }
        tracing::info!("Relay instance {} shut down", self.state.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::LocalHub;
    use crate::transport::{close_codes, Connection, MockConnection};
    use waypost_types::Message;

    fn start(config: Config) -> Result<RelayHandle, RelayError> {
        let (overlay, events) = LocalHub::new().join();
        Relay::start_with(
            config,
            Arc::new(overlay),
            events,
            RelayOptions {
                parallelism: Some(2),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = Config::default();
        config.scheduler.size = 0;
        assert!(matches!(start(config), Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn start_rejects_oversized_pool() {
        let mut config = Config::default();
        config.workers.processors = 4;
        assert!(matches!(start(config), Err(RelayError::Worker(_))));
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let handle = start(Config::default()).unwrap();
        let state = handle.state();
        let conn = MockConnection::new();

        state.frame(conn.handle(), Message::init(Address::from([1; 16]), None).encode());

        // Wait for the challenge so the coordinator has seen the connection
        for _ in 0..200 {
            if !conn.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(RelayMetrics::get(&state.metrics().frames_received), 1);

        handle.shutdown().await;
        assert_eq!(conn.closed_with().map(|c| c.0), Some(close_codes::NORMAL));
        assert!(!conn.is_open());
    }
}
