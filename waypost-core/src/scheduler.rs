//! Offline message scheduler for waypost.
//!
//! This module provides a per-recipient queue for payloads whose recipient
//! is not connected to this relay:
//! - FIFO ordering per recipient
//! - A per-recipient capacity, dropping the oldest entry on overflow
//! - A TTL sweep that runs at most once per timeframe
//!
//! The scheduler is in-memory only. Nothing survives a restart and entries
//! past their TTL are dropped silently.

use std::collections::{HashMap, VecDeque};
use waypost_types::Address;

/// Default number of buffered messages per recipient.
pub const DEFAULT_LIMIT_SIZE: usize = 20;

/// Default buffer TTL and minimum spacing between sweeps (60 seconds).
pub const DEFAULT_TIMEFRAME_MS: u64 = 60_000;

/// A buffered frame waiting for its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMessage {
    /// Encoded frame, forwarded unchanged.
    pub message: Vec<u8>,
    /// Insertion time in epoch milliseconds.
    pub timestamp: u64,
}

impl ScheduledMessage {
    /// Create a new scheduled message.
    pub fn new(message: Vec<u8>, timestamp: u64) -> Self {
        Self { message, timestamp }
    }
}

/// Bounded, TTL-limited per-recipient FIFO.
///
/// Entries flow through the scheduler in this order:
/// 1. `add()` - buffer for a recipient
/// 2. `cleanup()` - periodic TTL sweep
/// 3. `get_all()` - drain on registration
#[derive(Debug)]
pub struct MessageScheduler {
    /// Maximum entries per recipient.
    limit_size: usize,
    /// Entry TTL and sweep spacing.
    timeframe_ms: u64,
    /// Buffered entries by recipient.
    entries: HashMap<Address, VecDeque<ScheduledMessage>>,
    /// Time of the last sweep that actually ran.
    last_cleanup: Option<u64>,
}

impl Default for MessageScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_SIZE, DEFAULT_TIMEFRAME_MS)
    }
}

impl MessageScheduler {
    /// Create a scheduler with the given per-recipient capacity and TTL.
    pub fn new(limit_size: usize, timeframe_ms: u64) -> Self {
        Self {
            limit_size: limit_size.max(1),
            timeframe_ms,
            entries: HashMap::new(),
            last_cleanup: None,
        }
    }

    /// Buffer `message` for `key`.
    ///
    /// If the recipient is already at capacity the oldest entry is dropped
    /// first and returned.
    pub fn add(&mut self, key: Address, message: ScheduledMessage) -> Option<ScheduledMessage> {
        let queue = self.entries.entry(key).or_default();
        let dropped = if queue.len() >= self.limit_size {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        dropped
    }

    /// Sweep entries older than the timeframe.
    ///
    /// Runs at most once per timeframe; calls inside the window are no-ops.
    /// Recipients left with no entries are removed. Returns the number of
    /// entries dropped.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        if let Some(last) = self.last_cleanup {
            if now_ms.saturating_sub(last) < self.timeframe_ms {
                return 0;
            }
        }
        self.last_cleanup = Some(now_ms);

        let timeframe = self.timeframe_ms;
        let mut dropped = 0;
        self.entries.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| now_ms.saturating_sub(m.timestamp) <= timeframe);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    /// Drain every entry buffered for `key`, oldest first.
    pub fn get_all(&mut self, key: &Address) -> Vec<ScheduledMessage> {
        self.entries
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drop every entry buffered for `key` without returning it.
    pub fn discard(&mut self, key: &Address) -> usize {
        self.entries.remove(key).map_or(0, |q| q.len())
    }

    /// Number of entries buffered for `key`.
    pub fn len_for(&self, key: &Address) -> usize {
        self.entries.get(key).map_or(0, VecDeque::len)
    }

    /// Number of recipients with buffered entries.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Total number of buffered entries.
    pub fn total_count(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-recipient capacity.
    pub fn limit_size(&self) -> usize {
        self.limit_size
    }
}
