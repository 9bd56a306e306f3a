//! Transport boundary for the relay.
//!
//! A [`Connection`] is one client's duplex frame stream. The coordinator
//! only ever sees whole frames and never blocks on a write:
//! - `send()` queues bytes and returns immediately
//! - `close()` starts a close handshake with a code and reason
//! - `pause()`/`resume()` stop and restart reading further frames
//!
//! Inbound frames and close notifications reach the coordinator as
//! [`RelayEvent`](crate::proxy::RelayEvent)s.

mod mock;
pub mod ws;

pub use mock::MockConnection;
pub use ws::WsConnection;

use crate::error::TransportError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Shared handle to a live connection.
pub type ConnectionHandle = Arc<dyn Connection>;

/// WebSocket close codes used by the relay.
pub mod close_codes {
    /// Normal closure (shutdown).
    pub const NORMAL: u16 = 1000;
    /// Policy violation (permission denied).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Handshake not completed within the pending interval.
    pub const PENDING_TIMEOUT: u16 = 4000;
    /// Another connection registered the same address.
    pub const SUPERSEDED: u16 = 4001;
    /// Evicted by the cleanup sweep.
    pub const STALE: u16 = 4002;
    /// The address registered on another relay instance.
    pub const RELOCATED: u16 = 4003;
}

/// A client connection as seen by the coordinator.
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Identifier, unique for the process lifetime.
    fn id(&self) -> ConnectionId;

    /// Queue a frame for delivery.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close with a code and reason. Idempotent.
    fn close(&self, code: u16, reason: &str);

    /// Check if the transport is still open.
    fn is_open(&self) -> bool;

    /// Stop reading further frames.
    fn pause(&self);

    /// Resume reading.
    fn resume(&self);
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
