//! Rate limiting for waypost-relay.
//!
//! Two layers protect the coordinator:
//!
//! - A **global** admission ceiling across all connections, backed by the
//!   governor crate. Frames beyond it are dropped.
//! - A **per-connection** window counter. One shared tick advances every
//!   interval for all connections, so there is no timer per connection.
//!   A connection that exceeds its window has its reads paused for one
//!   interval. The frame that tripped the limit is still processed.

use crate::config::LimitsConfig;
use crate::transport::{ConnectionHandle, ConnectionId};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outcome of a per-connection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Within the window limit.
    Allowed,
    /// Over the limit; reads are paused for one interval.
    Limited,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    tick: u64,
    count: u32,
}

/// Per-connection window limiter driven by a shared tick.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    interval: Duration,
    tick: Arc<AtomicU64>,
    windows: HashMap<ConnectionId, Window>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` frames per `interval`.
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            tick: Arc::new(AtomicU64::new(0)),
            windows: HashMap::new(),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.limit, config.interval())
    }

    /// Count one inbound frame on `conn`.
    ///
    /// Past the limit the connection is paused and a resume is scheduled
    /// one interval later. Must be called from within a tokio runtime.
    pub fn check(&mut self, conn: &ConnectionHandle) -> Admission {
        let current = self.tick.load(Ordering::Acquire);
        let window = self.windows.entry(conn.id()).or_insert(Window {
            tick: current,
            count: 0,
        });

        if window.tick != current {
            *window = Window {
                tick: current,
                count: 1,
            };
            return Admission::Allowed;
        }

        window.count = window.count.saturating_add(1);
        if window.count <= self.limit {
            return Admission::Allowed;
        }

        tracing::debug!(
            "Connection {} exceeded {} frames per {:?}, pausing",
            conn.id(),
            self.limit,
            self.interval
        );
        conn.pause();
        let conn = conn.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            conn.resume();
        });
        Admission::Limited
    }

    /// Advance the shared tick by one window.
    pub fn advance(&self) {
        self.tick.fetch_add(1, Ordering::AcqRel);
    }

    /// Spawn the task that advances the tick every interval.
    pub fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let tick = self.tick.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                tick.fetch_add(1, Ordering::AcqRel);
            }
        })
    }

    /// Stop tracking a closed connection.
    pub fn forget(&mut self, conn_id: ConnectionId) {
        self.windows.remove(&conn_id);
    }

    /// Number of tracked connections (for metrics).
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Aggregate admission ceiling across all connections.
pub struct GlobalLimiter {
    limiter: DirectLimiter,
}

impl std::fmt::Debug for GlobalLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLimiter")
            .field("limiter", &"DirectLimiter")
            .finish()
    }
}

impl GlobalLimiter {
    /// Allow `per_second` frames per second. Zero is treated as one.
    pub fn new(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: governor::RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Check if the global frame rate is within limits.
    pub fn check(&self) -> Result<(), RateLimitError> {
        self.limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Global frame rate exceeded across all connections.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlobalLimitExceeded => {
                write!(f, "global rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
