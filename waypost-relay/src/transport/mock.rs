//! Mock connection for testing.
//!
//! Captures sent frames, close calls and pause/resume calls for
//! verification.

use super::{next_connection_id, Connection, ConnectionId};
use crate::error::TransportError;
use std::sync::{Arc, Mutex};
use waypost_types::Message;

/// Mock connection for testing.
///
/// Clones share state, so a test can keep one clone while the
/// coordinator holds another.
#[derive(Debug, Clone)]
pub struct MockConnection {
    id: ConnectionId,
    inner: Arc<Mutex<MockConnectionInner>>,
}

#[derive(Debug)]
struct MockConnectionInner {
    open: bool,
    sent: Vec<Vec<u8>>,
    closed_with: Option<(u16, String)>,
    pauses: usize,
    resumes: usize,
    fail_next_send: Option<String>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    /// Create a new open mock connection.
    pub fn new() -> Self {
        Self {
            id: next_connection_id(),
            inner: Arc::new(Mutex::new(MockConnectionInner {
                open: true,
                sent: Vec::new(),
                closed_with: None,
                pauses: 0,
                resumes: 0,
                fail_next_send: None,
            })),
        }
    }

    /// Shareable handle for the coordinator.
    pub fn handle(&self) -> super::ConnectionHandle {
        Arc::new(self.clone())
    }

    /// Get all frames that were sent.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Sent frames, decoded. Undecodable frames are skipped.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .iter()
            .filter_map(|b| Message::decode(b).ok())
            .collect()
    }

    /// Remove and return everything sent so far.
    pub fn take_sent(&self) -> Vec<Message> {
        let frames = std::mem::take(&mut self.inner.lock().unwrap().sent);
        frames
            .iter()
            .filter_map(|b| Message::decode(b).ok())
            .collect()
    }

    /// Close code and reason, if closed via `close()`.
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.inner.lock().unwrap().closed_with.clone()
    }

    /// Number of `pause()` calls.
    pub fn pause_count(&self) -> usize {
        self.inner.lock().unwrap().pauses
    }

    /// Number of `resume()` calls.
    pub fn resume_count(&self) -> usize {
        self.inner.lock().unwrap().resumes
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_send = Some(error.to_string());
    }

    /// Simulate the peer dropping the transport without a close call.
    pub fn drop_transport(&self) {
        self.inner.lock().unwrap().open = false;
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.open {
            return Err(TransportError::ConnectionClosed);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent.push(frame);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed_with.is_none() {
            inner.closed_with = Some((code, reason.to_string()));
        }
        inner.open = false;
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn pause(&self) {
        self.inner.lock().unwrap().pauses += 1;
    }

    fn resume(&self) {
        self.inner.lock().unwrap().resumes += 1;
    }
}
