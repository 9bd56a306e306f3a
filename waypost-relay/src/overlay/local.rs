//! In-process overlay.
//!
//! A [`LocalHub`] connects any number of [`LocalOverlay`] peers inside one
//! process. It backs a standalone relay and lets tests run several relay
//! instances against each other without a network.

use super::{Overlay, OverlayEvent};
use crate::error::OverlayError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type PeerId = u64;

#[derive(Debug)]
struct Peer {
    topics: HashSet<String>,
    events: mpsc::UnboundedSender<OverlayEvent>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_peer: PeerId,
    peers: HashMap<PeerId, Peer>,
}

/// Shared in-process publish/subscribe hub.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as a new peer.
    ///
    /// Returns the peer's overlay handle and the stream of messages
    /// published on topics it subscribes to.
    pub fn join(&self) -> (LocalOverlay, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_peer;
        inner.next_peer += 1;
        inner.peers.insert(
            id,
            Peer {
                topics: HashSet::new(),
                events: tx,
            },
        );
        drop(inner);

        let overlay = LocalOverlay {
            id,
            hub: self.clone(),
        };
        (overlay, rx)
    }

    /// Number of joined peers.
    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        // A poisoned hub only means a peer panicked mid-update; the maps stay usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One peer's handle on a [`LocalHub`]. Leaves the hub when dropped.
#[derive(Debug)]
pub struct LocalOverlay {
    id: PeerId,
    hub: LocalHub,
}

impl LocalOverlay {
    /// Whether this peer is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.hub
            .lock()
            .peers
            .get(&self.id)
            .is_some_and(|p| p.topics.contains(topic))
    }
}

#[async_trait]
impl Overlay for LocalOverlay {
    async fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        let mut inner = self.hub.lock();
        let peer = inner.peers.get_mut(&self.id).ok_or(OverlayError::Closed)?;
        peer.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), OverlayError> {
        let mut inner = self.hub.lock();
        let peer = inner.peers.get_mut(&self.id).ok_or(OverlayError::Closed)?;
        peer.topics.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), OverlayError> {
        let inner = self.hub.lock();
        if !inner.peers.contains_key(&self.id) {
            return Err(OverlayError::Closed);
        }

        for (id, peer) in &inner.peers {
            if *id == self.id || !peer.topics.contains(topic) {
                continue;
            }
            let event = OverlayEvent {
                topic: topic.to_string(),
                data: data.clone(),
            };
            if peer.events.send(event).is_err() {
                tracing::debug!("Overlay peer {} stopped listening", id);
            }
        }
        Ok(())
    }
}

impl Drop for LocalOverlay {
    fn drop(&mut self) {
        self.hub.lock().peers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_other_subscribers() {
        let hub = LocalHub::new();
        let (a, mut a_rx) = hub.join();
        let (b, mut b_rx) = hub.join();

        a.subscribe("t").await.unwrap();
        b.subscribe("t").await.unwrap();
        a.publish("t", vec![1, 2]).await.unwrap();

        let event = b_rx.recv().await.unwrap();
        assert_eq!(event.topic, "t");
        assert_eq!(event.data, vec![1, 2]);

        // The publisher does not hear itself
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_peers_receive_nothing() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.join();
        let (b, mut b_rx) = hub.join();

        b.subscribe("t").await.unwrap();
        assert!(b.is_subscribed("t"));
        b.unsubscribe("t").await.unwrap();
        assert!(!b.is_subscribed("t"));

        a.publish("t", vec![1]).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_peer_leaves_hub() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.join();
        let (b, _b_rx) = hub.join();
        assert_eq!(hub.peer_count(), 2);

        drop(b);
        assert_eq!(hub.peer_count(), 1);
        assert!(a.publish("t", vec![1]).await.is_ok());
    }
}
