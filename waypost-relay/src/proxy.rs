//! Connection coordinator.
//!
//! The [`Proxy`] owns every piece of routing state: the pending and
//! registered address maps, activity timestamps, the offline scheduler and
//! the rate limiter. It runs as one task and reacts to [`RelayEvent`]s
//! from transports, worker units and its own timers, so none of that state
//! needs a lock.
//!
//! Per address the lifecycle is `unknown -> pending -> registered -> closed`.
//! An address is never pending and registered at the same time.

use crate::config::Config;
use crate::limits::{Admission, GlobalLimiter, RateLimiter};
use crate::overlay::{address_topic, Notice, NoticeKind, OverlayEvent, NOTICE_TOPIC};
use crate::server::RelayMetrics;
use crate::transport::{close_codes, ConnectionHandle, ConnectionId};
use crate::worker::{Dispatcher, OverlayCommand, ProcessorCommand, ProcessorOutput, WorkerMessage};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use waypost_core::{
    Action, Clock, MessageScheduler, PermissionFilter, ScheduledMessage, Verdict,
};
use waypost_types::{Address, Message, MessageType, VERSION};

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    /// A whole frame arrived on a connection.
    Frame {
        /// The connection it arrived on.
        conn: ConnectionHandle,
        /// Raw frame bytes.
        bytes: Vec<u8>,
    },
    /// A connection closed.
    Closed {
        /// The closed connection.
        conn_id: ConnectionId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A processor unit produced an action.
    Processor(ProcessorOutput),
    /// A message arrived from the overlay.
    Overlay(OverlayEvent),
    /// A pending handshake ran out of time.
    PendingExpired {
        /// Address that was pending.
        address: Address,
        /// Connection the timer was started for.
        conn_id: ConnectionId,
    },
    /// The delayed overlay unsubscribe for an address is due.
    UnsubscribeDue {
        /// Address whose topic to drop.
        address: Address,
        /// Timer generation; stale generations are ignored.
        generation: u64,
    },
    /// Run the cleanup sweep.
    Cleanup,
    /// Stop the coordinator.
    Shutdown,
}

#[derive(Debug)]
struct PendingEntry {
    conn: ConnectionHandle,
    permissions: Option<PermissionFilter>,
    timer: JoinHandle<()>,
}

#[derive(Debug)]
struct RegisteredEntry {
    conn: ConnectionHandle,
    last_activity: u64,
    permissions: Option<PermissionFilter>,
}

#[derive(Debug)]
struct UnsubscribeTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// The connection registry and router.
pub struct Proxy<D: Dispatcher> {
    instance_id: Address,
    pending_interval: Duration,
    idle_timeout_ms: u64,
    delivery_notices: bool,
    permissions: PermissionFilter,

    connections: HashMap<ConnectionId, ConnectionHandle>,
    pending: HashMap<Address, PendingEntry>,
    registered: HashMap<Address, RegisteredEntry>,
    by_connection: HashMap<ConnectionId, Address>,
    unsubscribe_timers: HashMap<Address, UnsubscribeTimer>,
    next_generation: u64,

    scheduler: MessageScheduler,
    limiter: RateLimiter,
    global: GlobalLimiter,

    dispatcher: D,
    events: mpsc::UnboundedSender<RelayEvent>,
    metrics: Arc<RelayMetrics>,
    clock: Arc<dyn Clock>,
}

impl<D: Dispatcher> std::fmt::Debug for Proxy<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("instance_id", &self.instance_id)
            .field("connections", &self.connections.len())
            .field("pending", &self.pending.len())
            .field("registered", &self.registered.len())
            .field("buffered", &self.scheduler.total_count())
            .finish_non_exhaustive()
    }
}

impl<D: Dispatcher> Proxy<D> {
    /// Build a coordinator.
    ///
    /// `events` is the sending half of the channel [`run`](Self::run)
    /// consumes; the coordinator's own timers post into it.
    pub fn new(
        config: &Config,
        instance_id: Address,
        dispatcher: D,
        events: mpsc::UnboundedSender<RelayEvent>,
        metrics: Arc<RelayMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_id,
            pending_interval: config.scheduler.interval(),
            idle_timeout_ms: config.cleanup.idle_timeout_secs.saturating_mul(1000),
            delivery_notices: config.overlay.delivery_notices,
            permissions: PermissionFilter::new(
                config.permissions.allow_list.iter().copied(),
                config.permissions.deny_list.iter().copied(),
            ),
            connections: HashMap::new(),
            pending: HashMap::new(),
            registered: HashMap::new(),
            by_connection: HashMap::new(),
            unsubscribe_timers: HashMap::new(),
            next_generation: 0,
            scheduler: MessageScheduler::new(config.scheduler.size, config.scheduler.timeframe_ms),
            limiter: RateLimiter::from_config(&config.limits),
            global: GlobalLimiter::new(config.limits.global_messages_per_second),
            dispatcher,
            events,
            metrics,
            clock,
        }
    }

    /// Spawn the shared rate-limit tick.
    pub fn spawn_limiter_ticker(&self) -> JoinHandle<()> {
        self.limiter.spawn_ticker()
    }

    /// Process events until [`RelayEvent::Shutdown`] or until every sender
    /// is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        tracing::info!("Coordinator {} started", self.instance_id);
        self.post(OverlayCommand::Subscribe(NOTICE_TOPIC.to_string()));
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                tracing::info!("Coordinator {} stopped", self.instance_id);
                return;
            }
        }
        self.shutdown();
        tracing::info!("Coordinator {} stopped", self.instance_id);
    }

    /// Apply one event. Returns `false` once the coordinator has shut down.
    pub fn handle(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Frame { conn, bytes } => self.on_frame(conn, bytes),
            RelayEvent::Closed {
                conn_id,
                code,
                reason,
            } => self.on_closed(conn_id, code, &reason),
            RelayEvent::Processor(output) => self.on_processor_output(output),
            RelayEvent::Overlay(event) => self.on_overlay_event(event),
            RelayEvent::PendingExpired { address, conn_id } => {
                self.on_pending_expired(address, conn_id)
            }
            RelayEvent::UnsubscribeDue {
                address,
                generation,
            } => self.on_unsubscribe_due(address, generation),
            RelayEvent::Cleanup => {
                self.sweep();
            }
            RelayEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        self.update_gauges();
        true
    }

    // ===========================================
    // Inbound frames
    // ===========================================

    fn on_frame(&mut self, conn: ConnectionHandle, bytes: Vec<u8>) {
        self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.global.check() {
            self.metrics.global_limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dropping frame from connection {}: {}", conn.id(), e);
            return;
        }

        self.connections
            .entry(conn.id())
            .or_insert_with(|| conn.clone());

        // Limited frames are still processed; only further reads pause
        if self.limiter.check(&conn) == Admission::Limited {
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        }

        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Malformed frame from connection {}: {}", conn.id(), e);
                return;
            }
        };

        if message.version != VERSION {
            tracing::debug!(
                "Unsupported protocol version {} from connection {}",
                message.version,
                conn.id()
            );
            return;
        }

        if self.permissions.check(&message.sender) == Verdict::Denied {
            self.metrics.denied.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Denied {:?} from {} on connection {}",
                message.kind,
                message.sender,
                conn.id()
            );
            if message.kind == MessageType::Init {
                conn.close(close_codes::POLICY_VIOLATION, "not permitted");
            }
            return;
        }

        match message.kind {
            MessageType::Init => self.on_init(conn, message),
            MessageType::Payload => self.on_payload(conn, message),
            _ => self.post(ProcessorCommand::Process {
                conn_id: conn.id(),
                message,
            }),
        }
    }

    fn on_init(&mut self, conn: ConnectionHandle, message: Message) {
        let address = message.sender;
        let permissions = match message.parse_permissions() {
            Ok(lists) => lists.map(PermissionFilter::from),
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Malformed init from {}: {}", address, e);
                return;
            }
        };

        // A connection speaks for one address at a time
        if let Some(previous) = self.by_connection.get(&conn.id()).copied() {
            if previous != address {
                self.release(previous, conn.id());
            }
        }

        if let Some(entry) = self.registered.remove(&address) {
            self.by_connection.remove(&entry.conn.id());
            if entry.conn.id() != conn.id() {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::info!("{} re-initialised on connection {}, evicting", address, conn.id());
                entry.conn.close(close_codes::SUPERSEDED, "address re-initialised elsewhere");
            }
            // Cancelled again if the new handshake registers
            self.schedule_unsubscribe(address);
        }

        if let Some(entry) = self.pending.remove(&address) {
            entry.timer.abort();
            if entry.conn.id() != conn.id() {
                self.by_connection.remove(&entry.conn.id());
                entry.conn.close(close_codes::SUPERSEDED, "handshake superseded");
            }
        }

        let timer = self.spawn_pending_timer(address, conn.id());
        self.by_connection.insert(conn.id(), address);
        self.pending.insert(
            address,
            PendingEntry {
                conn: conn.clone(),
                permissions,
                timer,
            },
        );
        tracing::debug!("{} pending on connection {}", address, conn.id());

        self.post(ProcessorCommand::Process {
            conn_id: conn.id(),
            message,
        });
    }

    fn on_payload(&mut self, conn: ConnectionHandle, message: Message) {
        let sender = message.sender;
        let bound = self.by_connection.get(&conn.id()) == Some(&sender)
            && self.registered.contains_key(&sender);
        if !bound {
            self.metrics.denied.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Payload claiming {} on connection {} which is not registered as it",
                sender,
                conn.id()
            );
            return;
        }

        self.touch(&sender);
        self.post(ProcessorCommand::Process {
            conn_id: conn.id(),
            message,
        });
    }

    // ===========================================
    // Processor results
    // ===========================================

    fn on_processor_output(&mut self, output: ProcessorOutput) {
        match output.action {
            Action::Register { sender, reply } => self.register(output.conn_id, sender, reply),
            Action::Respond(message) => {
                let Some(conn) = self.connections.get(&output.conn_id) else {
                    tracing::debug!("Reply for vanished connection {}", output.conn_id);
                    return;
                };
                if let Err(e) = conn.send(message.encode()) {
                    tracing::debug!("Reply to connection {} failed: {}", output.conn_id, e);
                }
            }
            Action::Send(message) => self.route(message),
        }
    }

    fn register(&mut self, conn_id: ConnectionId, sender: Address, reply: Message) {
        match self.pending.get(&sender) {
            Some(entry) if entry.conn.id() == conn_id => {}
            _ => {
                tracing::debug!(
                    "Ignoring registration of {} for connection {} that is no longer pending",
                    sender,
                    conn_id
                );
                return;
            }
        }
        let Some(pending) = self.pending.remove(&sender) else {
            return;
        };
        pending.timer.abort();

        // Last writer wins
        if let Some(previous) = self.registered.remove(&sender) {
            self.by_connection.remove(&previous.conn.id());
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            previous.conn.close(close_codes::SUPERSEDED, "registered elsewhere");
        }

        let conn = pending.conn;
        self.registered.insert(
            sender,
            RegisteredEntry {
                conn: conn.clone(),
                last_activity: self.clock.now_ms(),
                permissions: pending.permissions,
            },
        );
        self.by_connection.insert(conn_id, sender);
        self.cancel_unsubscribe(&sender);
        self.metrics.registrations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("{} registered on connection {}", sender, conn_id);

        self.post(OverlayCommand::Subscribe(address_topic(&sender)));
        self.announce(Notice::registered(self.instance_id, sender));

        if let Err(e) = conn.send(reply.encode()) {
            tracing::warn!("Sending accepted to {} failed: {}", sender, e);
            return;
        }
        self.flush(&sender, &conn);
    }

    /// Deliver everything buffered for `address`, oldest first.
    fn flush(&mut self, address: &Address, conn: &ConnectionHandle) {
        let mut buffered = self.scheduler.get_all(address).into_iter();
        let mut delivered = 0;
        while let Some(entry) = buffered.next() {
            if let Err(e) = conn.send(entry.message.clone()) {
                tracing::debug!("Flush to {} stopped: {}", address, e);
                // Keep what could not be written
                self.scheduler.add(*address, entry);
                for rest in buffered {
                    self.scheduler.add(*address, rest);
                }
                break;
            }
            delivered += 1;
        }
        if delivered > 0 {
            self.metrics.delivered.fetch_add(delivered, Ordering::Relaxed);
            tracing::debug!("Flushed {} buffered messages to {}", delivered, address);
        }
    }

    /// Deliver a payload locally, or buffer it and forward it to the overlay.
    fn route(&mut self, message: Message) {
        let recipient = message.recipient;
        let sender = message.sender;

        match self.deliver_local(&message) {
            Delivery::Delivered => {
                self.touch(&sender);
                if self.delivery_notices {
                    self.announce(Notice::delivered(self.instance_id, recipient));
                }
            }
            Delivery::Denied => {}
            Delivery::Absent => {
                let bytes = message.encode();
                self.buffer(recipient, bytes.clone());
                self.publish(address_topic(&recipient), bytes);
            }
        }
    }

    fn deliver_local(&self, message: &Message) -> Delivery {
        let Some(entry) = self.registered.get(&message.recipient) else {
            return Delivery::Absent;
        };
        if !entry.conn.is_open() {
            return Delivery::Absent;
        }
        if let Some(filter) = &entry.permissions {
            if filter.check(&message.sender) == Verdict::Denied {
                self.metrics.denied.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "{} does not accept payloads from {}",
                    message.recipient,
                    message.sender
                );
                return Delivery::Denied;
            }
        }
        match entry.conn.send(message.encode()) {
            Ok(()) => {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Delivered {} -> {}", message.sender, message.recipient);
                Delivery::Delivered
            }
            Err(e) => {
                tracing::debug!("Delivery to {} failed: {}", message.recipient, e);
                Delivery::Absent
            }
        }
    }

    fn buffer(&mut self, recipient: Address, bytes: Vec<u8>) {
        let now = self.clock.now_ms();
        self.scheduler.cleanup(now);
        if self
            .scheduler
            .add(recipient, ScheduledMessage::new(bytes, now))
            .is_some()
        {
            tracing::debug!("Buffer for {} full, dropped oldest", recipient);
        }
        self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
    }

    // ===========================================
    // Overlay
    // ===========================================

    fn on_overlay_event(&mut self, event: OverlayEvent) {
        self.metrics.overlay_received.fetch_add(1, Ordering::Relaxed);
        if event.topic == NOTICE_TOPIC {
            self.on_notice(&event.data);
        } else {
            self.on_forwarded(&event.topic, &event.data);
        }
    }

    fn on_notice(&mut self, data: &[u8]) {
        let notice = match Notice::decode(data) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::debug!("Ignoring overlay notice: {}", e);
                return;
            }
        };
        if notice.origin == self.instance_id {
            return;
        }

        match notice.kind {
            NoticeKind::Registered => {
                if self.registered.contains_key(&notice.address) {
                    tracing::info!(
                        "{} registered on relay {}, closing local connection",
                        notice.address,
                        notice.origin
                    );
                    self.evict(&notice.address, close_codes::RELOCATED, "registered on another relay");
                }
                let buffered = self.scheduler.get_all(&notice.address);
                if !buffered.is_empty() {
                    tracing::debug!(
                        "Forwarding {} buffered messages for {} to relay {}",
                        buffered.len(),
                        notice.address,
                        notice.origin
                    );
                }
                let topic = address_topic(&notice.address);
                for entry in buffered {
                    self.publish(topic.clone(), entry.message);
                }
            }
            NoticeKind::Delivered => {
                let dropped = self.scheduler.discard(&notice.address);
                if dropped > 0 {
                    tracing::debug!(
                        "Dropped {} buffered messages for {} delivered by relay {}",
                        dropped,
                        notice.address,
                        notice.origin
                    );
                }
            }
        }
    }

    fn on_forwarded(&mut self, topic: &str, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) if message.kind == MessageType::Payload => message,
            Ok(message) => {
                tracing::debug!("Ignoring forwarded {:?} on {}", message.kind, topic);
                return;
            }
            Err(e) => {
                tracing::debug!("Malformed forwarded frame on {}: {}", topic, e);
                return;
            }
        };
        if address_topic(&message.recipient) != topic {
            tracing::debug!("Forwarded payload for {} arrived on {}", message.recipient, topic);
            return;
        }

        match self.deliver_local(&message) {
            Delivery::Delivered => {
                self.announce(Notice::delivered(self.instance_id, message.recipient));
            }
            Delivery::Denied => {}
            // Hold it until the recipient shows up; another relay already fanned it out
            Delivery::Absent => self.buffer(message.recipient, data.to_vec()),
        }
    }

    // ===========================================
    // Teardown
    // ===========================================

    fn on_closed(&mut self, conn_id: ConnectionId, code: u16, reason: &str) {
        self.connections.remove(&conn_id);
        self.limiter.forget(conn_id);

        let Some(address) = self.by_connection.remove(&conn_id) else {
            return;
        };
        tracing::debug!(
            "Connection {} for {} closed ({} {})",
            conn_id,
            address,
            code,
            reason
        );

        // Only an unfinished handshake can hold a challenge
        if self
            .pending
            .get(&address)
            .is_some_and(|e| e.conn.id() == conn_id)
        {
            if let Some(entry) = self.pending.remove(&address) {
                entry.timer.abort();
            }
            self.post(ProcessorCommand::Closed { address });
        }

        if self
            .registered
            .get(&address)
            .is_some_and(|e| e.conn.id() == conn_id)
        {
            self.registered.remove(&address);
            self.schedule_unsubscribe(address);
        }
    }

    fn on_pending_expired(&mut self, address: Address, conn_id: ConnectionId) {
        if !self
            .pending
            .get(&address)
            .is_some_and(|e| e.conn.id() == conn_id)
        {
            return;
        }
        let Some(entry) = self.pending.remove(&address) else {
            return;
        };
        self.by_connection.remove(&conn_id);
        tracing::info!("Handshake for {} on connection {} timed out", address, conn_id);
        entry.conn.close(close_codes::PENDING_TIMEOUT, "handshake timed out");
        self.post(ProcessorCommand::Closed { address });
    }

    fn on_unsubscribe_due(&mut self, address: Address, generation: u64) {
        match self.unsubscribe_timers.get(&address) {
            Some(timer) if timer.generation == generation => {
                self.unsubscribe_timers.remove(&address);
            }
            _ => return,
        }
        if !self.registered.contains_key(&address) {
            self.post(OverlayCommand::Unsubscribe(address_topic(&address)));
        }
    }

    /// Drop the binding between `address` and `conn_id` without closing.
    fn release(&mut self, address: Address, conn_id: ConnectionId) {
        if self
            .pending
            .get(&address)
            .is_some_and(|e| e.conn.id() == conn_id)
        {
            if let Some(entry) = self.pending.remove(&address) {
                entry.timer.abort();
            }
            self.post(ProcessorCommand::Closed { address });
        }
        if self
            .registered
            .get(&address)
            .is_some_and(|e| e.conn.id() == conn_id)
        {
            self.registered.remove(&address);
            self.schedule_unsubscribe(address);
        }
        self.by_connection.remove(&conn_id);
    }

    /// Close and forget a registered address.
    fn evict(&mut self, address: &Address, code: u16, reason: &str) {
        let Some(entry) = self.registered.remove(address) else {
            return;
        };
        if self.by_connection.get(&entry.conn.id()) == Some(address) {
            self.by_connection.remove(&entry.conn.id());
        }
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        entry.conn.close(code, reason);
        self.schedule_unsubscribe(*address);
    }

    /// Evict registered entries that are closed, inconsistent or idle, and
    /// expire old buffered messages. Returns the number of evictions.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now_ms();
        let stale: Vec<(Address, &'static str)> = self
            .registered
            .iter()
            .filter_map(|(address, entry)| {
                let conn_id = entry.conn.id();
                if !entry.conn.is_open() {
                    Some((*address, "transport closed"))
                } else if self.by_connection.get(&conn_id) != Some(address)
                    || !self.connections.contains_key(&conn_id)
                {
                    Some((*address, "inconsistent bookkeeping"))
                } else if now.saturating_sub(entry.last_activity) > self.idle_timeout_ms {
                    Some((*address, "idle"))
                } else {
                    None
                }
            })
            .collect();

        for (address, reason) in &stale {
            tracing::info!("Cleanup: evicting {} ({})", address, reason);
            self.evict(address, close_codes::STALE, reason);
        }

        let expired = self.scheduler.cleanup(now);
        if stale.is_empty() && expired == 0 {
            tracing::debug!("Cleanup: nothing to do");
        } else {
            tracing::info!(
                "Cleanup: evicted {} connections, expired {} buffered messages",
                stale.len(),
                expired
            );
        }
        self.update_gauges();
        stale.len()
    }

    fn shutdown(&mut self) {
        tracing::info!(
            "Coordinator shutting down ({} connections)",
            self.connections.len()
        );
        self.dispatcher.kill();
        for conn in self.connections.values() {
            conn.close(close_codes::NORMAL, "relay shutting down");
        }
        for (_, entry) in self.pending.drain() {
            entry.timer.abort();
        }
        for (_, timer) in self.unsubscribe_timers.drain() {
            timer.task.abort();
        }
        self.registered.clear();
        self.by_connection.clear();
        self.connections.clear();
        self.update_gauges();
    }

    // ===========================================
    // Helpers
    // ===========================================

    fn post(&self, message: impl Into<WorkerMessage>) {
        let message = message.into();
        if let Err(e) = self.dispatcher.post(message) {
            tracing::warn!("Worker dispatch failed: {}", e);
        }
    }

    fn publish(&self, topic: String, data: Vec<u8>) {
        self.metrics.overlay_published.fetch_add(1, Ordering::Relaxed);
        self.post(OverlayCommand::Publish { topic, data });
    }

    fn announce(&self, notice: Notice) {
        self.metrics.overlay_published.fetch_add(1, Ordering::Relaxed);
        self.post(OverlayCommand::Announce(notice));
    }

    fn touch(&mut self, address: &Address) {
        let now = self.clock.now_ms();
        if let Some(entry) = self.registered.get_mut(address) {
            entry.last_activity = now;
        }
    }

    fn spawn_pending_timer(&self, address: Address, conn_id: ConnectionId) -> JoinHandle<()> {
        let events = self.events.clone();
        let delay = self.pending_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RelayEvent::PendingExpired { address, conn_id });
        })
    }

    fn schedule_unsubscribe(&mut self, address: Address) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let delay = self.pending_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RelayEvent::UnsubscribeDue {
                address,
                generation,
            });
        });
        if let Some(previous) = self
            .unsubscribe_timers
            .insert(address, UnsubscribeTimer { generation, task })
        {
            previous.task.abort();
        }
    }

    fn cancel_unsubscribe(&mut self, address: &Address) {
        if let Some(timer) = self.unsubscribe_timers.remove(address) {
            timer.task.abort();
        }
    }

    fn update_gauges(&self) {
        self.metrics
            .registered
            .store(self.registered.len() as u64, Ordering::Relaxed);
        self.metrics
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }

    /// Number of registered addresses.
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Number of pending handshakes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `address` is registered.
    pub fn is_registered(&self, address: &Address) -> bool {
        self.registered.contains_key(address)
    }

    /// Whether `address` is pending.
    pub fn is_pending(&self, address: &Address) -> bool {
        self.pending.contains_key(address)
    }

    /// Number of messages buffered for `address`.
    pub fn buffered_for(&self, address: &Address) -> usize {
        self.scheduler.len_for(address)
    }
}

enum Delivery {
    Delivered,
    Denied,
    Absent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, MockConnection};
    use crate::worker::RecordingDispatcher;
    use waypost_core::ManualClock;
    use waypost_types::InitPermissions;

    const INTERVAL_MS: u64 = 1_000;

    struct Harness {
        proxy: Proxy<RecordingDispatcher>,
        recorder: RecordingDispatcher,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        clock: ManualClock,
        metrics: Arc<RelayMetrics>,
        instance_id: Address,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.scheduler.interval_ms = INTERVAL_MS;
        config.scheduler.size = 3;
        config.scheduler.timeframe_ms = 60_000;
        config.cleanup.idle_timeout_secs = 60;
        config
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn harness_with(config: Config) -> Harness {
        let recorder = RecordingDispatcher::new();
        let (tx, events) = mpsc::unbounded_channel();
        let clock = ManualClock::new(1_000_000);
        let metrics = Arc::new(RelayMetrics::default());
        let instance_id = Address::from([0xee; 16]);
        let proxy = Proxy::new(
            &config,
            instance_id,
            recorder.clone(),
            tx,
            metrics.clone(),
            Arc::new(clock.clone()),
        );
        Harness {
            proxy,
            recorder,
            events,
            clock,
            metrics,
            instance_id,
        }
    }

    fn addr(n: u8) -> Address {
        Address::from([n; 16])
    }

    impl Harness {
        fn frame(&mut self, conn: &MockConnection, message: &Message) {
            self.proxy.handle(RelayEvent::Frame {
                conn: conn.handle(),
                bytes: message.encode(),
            });
        }

        fn output(&mut self, conn: &MockConnection, action: Action) {
            self.proxy.handle(RelayEvent::Processor(ProcessorOutput {
                conn_id: conn.id(),
                action,
            }));
        }

        /// Run the full handshake for `address` on `conn`, discarding traffic.
        fn register(&mut self, conn: &MockConnection, address: Address) {
            self.register_with(conn, address, None);
        }

        fn register_with(
            &mut self,
            conn: &MockConnection,
            address: Address,
            permissions: Option<&InitPermissions>,
        ) {
            self.frame(conn, &Message::init(address, permissions));
            self.output(
                conn,
                Action::Register {
                    sender: address,
                    reply: Message::accepted(address),
                },
            );
            conn.take_sent();
            self.recorder.take();
        }

        /// Feed every timer event that has fired so far.
        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.proxy.handle(event);
            }
        }

        fn overlay(&mut self, topic: &str, data: Vec<u8>) {
            self.proxy.handle(RelayEvent::Overlay(OverlayEvent {
                topic: topic.to_string(),
                data,
            }));
        }
    }

    fn published(messages: &[WorkerMessage]) -> Vec<(String, Vec<u8>)> {
        messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Overlay(OverlayCommand::Publish { topic, data }) => {
                    Some((topic.clone(), data.clone()))
                }
                WorkerMessage::Overlay(OverlayCommand::Announce(notice)) => {
                    Some((NOTICE_TOPIC.to_string(), notice.encode()))
                }
                _ => None,
            })
            .collect()
    }

    // ===========================================
    // Handshake
    // ===========================================

    #[tokio::test]
    async fn init_goes_pending_and_dispatches() {
        let mut h = harness();
        let conn = MockConnection::new();
        let init = Message::init(addr(1), None);

        h.frame(&conn, &init);

        assert!(h.proxy.is_pending(&addr(1)));
        assert_eq!(
            h.recorder.take(),
            vec![WorkerMessage::Processor(ProcessorCommand::Process {
                conn_id: conn.id(),
                message: init,
            })]
        );
        assert_eq!(RelayMetrics::get(&h.metrics.pending), 1);
    }

    #[tokio::test]
    async fn respond_writes_to_origin() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.frame(&conn, &Message::init(addr(1), None));

        let challenge = Message::challenge(addr(1), [0xff; 16], [7; 16]);
        h.output(&conn, Action::Respond(challenge.clone()));

        assert_eq!(conn.sent_messages(), vec![challenge]);
    }

    #[tokio::test]
    async fn register_accepts_and_announces() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.frame(&conn, &Message::init(addr(1), None));
        h.recorder.take();

        h.output(
            &conn,
            Action::Register {
                sender: addr(1),
                reply: Message::accepted(addr(1)),
            },
        );

        assert!(h.proxy.is_registered(&addr(1)));
        assert!(!h.proxy.is_pending(&addr(1)));
        assert_eq!(conn.sent_messages(), vec![Message::accepted(addr(1))]);

        let posted = h.recorder.take();
        assert!(posted.contains(&WorkerMessage::Overlay(OverlayCommand::Subscribe(
            address_topic(&addr(1))
        ))));
        assert_eq!(
            published(&posted),
            vec![(
                NOTICE_TOPIC.to_string(),
                Notice::registered(h.instance_id, addr(1)).encode()
            )]
        );
        assert_eq!(RelayMetrics::get(&h.metrics.registered), 1);
        assert_eq!(RelayMetrics::get(&h.metrics.registrations), 1);
    }

    #[tokio::test]
    async fn register_for_other_connection_is_ignored() {
        let mut h = harness();
        let conn = MockConnection::new();
        let stranger = MockConnection::new();
        h.frame(&conn, &Message::init(addr(1), None));

        h.output(
            &stranger,
            Action::Register {
                sender: addr(1),
                reply: Message::accepted(addr(1)),
            },
        );

        assert!(h.proxy.is_pending(&addr(1)));
        assert!(stranger.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_handshake_times_out() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.frame(&conn, &Message::init(addr(1), None));
        h.recorder.take();

        tokio::time::sleep(Duration::from_millis(INTERVAL_MS + 1)).await;
        h.pump();

        assert!(!h.proxy.is_pending(&addr(1)));
        assert_eq!(
            conn.closed_with().map(|c| c.0),
            Some(close_codes::PENDING_TIMEOUT)
        );
        assert_eq!(
            h.recorder.take(),
            vec![WorkerMessage::Processor(ProcessorCommand::Closed {
                address: addr(1)
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn registration_cancels_pending_timer() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.register(&conn, addr(1));

        tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 2)).await;
        h.pump();

        assert!(h.proxy.is_registered(&addr(1)));
        assert!(conn.closed_with().is_none());
    }

    // ===========================================
    // Duplicate registration
    // ===========================================

    #[tokio::test]
    async fn second_registration_evicts_first() {
        let mut h = harness();
        let first = MockConnection::new();
        let second = MockConnection::new();
        let peer = MockConnection::new();
        h.register(&first, addr(1));
        h.register(&peer, addr(2));

        h.register(&second, addr(1));

        assert_eq!(first.closed_with().map(|c| c.0), Some(close_codes::SUPERSEDED));
        assert!(second.is_open());

        let payload = Message::payload(addr(2), addr(1), b"hi".to_vec());
        h.output(&peer, Action::Send(payload.clone()));

        assert_eq!(second.sent_messages(), vec![payload]);
        assert!(first.sent().is_empty());
    }

    #[tokio::test]
    async fn competing_handshakes_keep_the_latest() {
        let mut h = harness();
        let first = MockConnection::new();
        let second = MockConnection::new();

        h.frame(&first, &Message::init(addr(1), None));
        h.frame(&second, &Message::init(addr(1), None));

        assert_eq!(h.proxy.pending_count(), 1);
        assert_eq!(first.closed_with().map(|c| c.0), Some(close_codes::SUPERSEDED));

        // The old connection closing must not disturb the new handshake
        h.proxy.handle(RelayEvent::Closed {
            conn_id: first.id(),
            code: close_codes::SUPERSEDED,
            reason: String::new(),
        });
        assert!(h.proxy.is_pending(&addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_then_expired_unsubscribes() {
        let mut h = harness();
        let first = MockConnection::new();
        let second = MockConnection::new();
        h.register(&first, addr(1));

        h.frame(&second, &Message::init(addr(1), None));
        assert_eq!(first.closed_with().map(|c| c.0), Some(close_codes::SUPERSEDED));
        h.recorder.take();

        // The new handshake is never answered
        tokio::time::sleep(Duration::from_millis(INTERVAL_MS + 1)).await;
        h.pump();

        assert_eq!(
            second.closed_with().map(|c| c.0),
            Some(close_codes::PENDING_TIMEOUT)
        );
        assert!(!h.proxy.is_registered(&addr(1)));
        assert!(h
            .recorder
            .take()
            .contains(&WorkerMessage::Overlay(OverlayCommand::Unsubscribe(
                address_topic(&addr(1))
            ))));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_then_registered_keeps_subscription() {
        let mut h = harness();
        let first = MockConnection::new();
        let second = MockConnection::new();
        h.register(&first, addr(1));

        h.register(&second, addr(1));

        tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 2)).await;
        h.pump();
        assert!(h.proxy.is_registered(&addr(1)));
        assert!(!h
            .recorder
            .take()
            .iter()
            .any(|m| matches!(m, WorkerMessage::Overlay(OverlayCommand::Unsubscribe(_)))));
    }

    #[tokio::test]
    async fn closing_mid_handshake_drops_challenge() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.frame(&conn, &Message::init(addr(1), None));
        h.recorder.take();

        h.proxy.handle(RelayEvent::Closed {
            conn_id: conn.id(),
            code: close_codes::NORMAL,
            reason: String::new(),
        });

        assert!(!h.proxy.is_pending(&addr(1)));
        assert_eq!(
            h.recorder.take(),
            vec![WorkerMessage::Processor(ProcessorCommand::Closed {
                address: addr(1)
            })]
        );
    }

    // ===========================================
    // Routing
    // ===========================================

    #[tokio::test]
    async fn payload_to_registered_recipient_is_delivered() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&alice, addr(1));
        h.register(&bob, addr(2));

        let payload = Message::payload(addr(2), addr(1), b"hello".to_vec());
        h.frame(&bob, &payload);
        assert_eq!(
            h.recorder.take(),
            vec![WorkerMessage::Processor(ProcessorCommand::Process {
                conn_id: bob.id(),
                message: payload.clone(),
            })]
        );

        h.output(&bob, Action::Send(payload.clone()));

        let received = alice.sent_messages();
        assert_eq!(received, vec![payload]);
        assert_eq!(received[0].sender, addr(2));
        assert_eq!(received[0].payload, b"hello".to_vec());
        assert_eq!(
            published(&h.recorder.take()),
            vec![(
                NOTICE_TOPIC.to_string(),
                Notice::delivered(h.instance_id, addr(1)).encode()
            )]
        );
    }

    #[tokio::test]
    async fn delivery_notices_can_be_disabled() {
        let mut config = test_config();
        config.overlay.delivery_notices = false;
        let mut h = harness_with(config);
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&alice, addr(1));
        h.register(&bob, addr(2));

        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![1])));

        assert_eq!(alice.sent().len(), 1);
        assert!(published(&h.recorder.take()).is_empty());
    }

    #[tokio::test]
    async fn payload_for_absent_recipient_is_buffered_then_flushed() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&bob, addr(2));

        let first = Message::payload(addr(2), addr(1), b"one".to_vec());
        let second = Message::payload(addr(2), addr(1), b"two".to_vec());
        h.output(&bob, Action::Send(first.clone()));
        h.output(&bob, Action::Send(second.clone()));

        assert_eq!(h.proxy.buffered_for(&addr(1)), 2);
        assert_eq!(
            published(&h.recorder.take()),
            vec![
                (address_topic(&addr(1)), first.encode()),
                (address_topic(&addr(1)), second.encode()),
            ]
        );

        h.frame(&alice, &Message::init(addr(1), None));
        h.output(
            &alice,
            Action::Register {
                sender: addr(1),
                reply: Message::accepted(addr(1)),
            },
        );

        assert_eq!(
            alice.sent_messages(),
            vec![Message::accepted(addr(1)), first, second]
        );
        assert_eq!(h.proxy.buffered_for(&addr(1)), 0);
    }

    #[tokio::test]
    async fn buffer_keeps_most_recent_entries() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&bob, addr(2));
        for i in 0..4u8 {
            h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![i])));
        }

        h.frame(&alice, &Message::init(addr(1), None));
        h.output(
            &alice,
            Action::Register {
                sender: addr(1),
                reply: Message::accepted(addr(1)),
            },
        );

        let payloads: Vec<Vec<u8>> = alice
            .sent_messages()
            .into_iter()
            .filter(|m| m.kind == MessageType::Payload)
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn failed_accept_keeps_buffer() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&bob, addr(2));
        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![1])));
        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![2])));

        h.frame(&alice, &Message::init(addr(1), None));
        alice.fail_next_send("boom");
        h.output(
            &alice,
            Action::Register {
                sender: addr(1),
                reply: Message::accepted(addr(1)),
            },
        );

        assert!(alice.sent().is_empty());
        assert_eq!(h.proxy.buffered_for(&addr(1)), 2);
    }

    #[tokio::test]
    async fn payload_from_unregistered_connection_is_dropped() {
        let mut h = harness();
        let alice = MockConnection::new();
        let mallory = MockConnection::new();
        h.register(&alice, addr(1));

        // Claims to be alice without having registered
        h.frame(&mallory, &Message::payload(addr(1), addr(1), vec![1]));

        assert!(h.recorder.take().is_empty());
        assert_eq!(RelayMetrics::get(&h.metrics.denied), 1);
    }

    // ===========================================
    // Permissions
    // ===========================================

    #[tokio::test]
    async fn denied_init_is_closed() {
        let mut config = test_config();
        config.permissions.deny_list = vec![addr(9)];
        let mut h = harness_with(config);
        let conn = MockConnection::new();

        h.frame(&conn, &Message::init(addr(9), None));

        assert!(!h.proxy.is_pending(&addr(9)));
        assert!(h.recorder.take().is_empty());
        assert_eq!(
            conn.closed_with().map(|c| c.0),
            Some(close_codes::POLICY_VIOLATION)
        );
        assert_eq!(RelayMetrics::get(&h.metrics.denied), 1);
    }

    #[tokio::test]
    async fn allow_list_excludes_unlisted() {
        let mut config = test_config();
        config.permissions.allow_list = vec![addr(1)];
        let mut h = harness_with(config);

        h.frame(&MockConnection::new(), &Message::init(addr(1), None));
        h.frame(&MockConnection::new(), &Message::init(addr(2), None));

        assert!(h.proxy.is_pending(&addr(1)));
        assert!(!h.proxy.is_pending(&addr(2)));
    }

    #[tokio::test]
    async fn recipient_lists_filter_senders() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        let carol = MockConnection::new();
        let lists = InitPermissions {
            allow: vec![],
            deny: vec![addr(2)],
        };
        h.register_with(&alice, addr(1), Some(&lists));
        h.register(&bob, addr(2));
        h.register(&carol, addr(3));

        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![1])));
        h.output(&carol, Action::Send(Message::payload(addr(3), addr(1), vec![2])));

        let received = alice.sent_messages();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, addr(3));
        assert_eq!(h.proxy.buffered_for(&addr(1)), 0);
    }

    // ===========================================
    // Frame admission
    // ===========================================

    #[tokio::test]
    async fn malformed_and_foreign_frames_are_dropped() {
        let mut h = harness();
        let conn = MockConnection::new();

        h.proxy.handle(RelayEvent::Frame {
            conn: conn.handle(),
            bytes: vec![0x10, 1, 2],
        });
        let mut foreign = Message::init(addr(1), None).encode();
        foreign[0] = 0x20;
        h.proxy.handle(RelayEvent::Frame {
            conn: conn.handle(),
            bytes: foreign,
        });

        assert!(h.recorder.take().is_empty());
        assert_eq!(RelayMetrics::get(&h.metrics.malformed), 1);
        assert_eq!(RelayMetrics::get(&h.metrics.frames_received), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn limited_frames_are_still_processed() {
        let mut config = test_config();
        config.limits.limit = 2;
        let mut h = harness_with(config);
        let conn = MockConnection::new();

        for _ in 0..3 {
            h.frame(&conn, &Message::init(addr(1), None));
        }

        assert_eq!(conn.pause_count(), 1);
        assert_eq!(h.recorder.take().len(), 3);
        assert_eq!(RelayMetrics::get(&h.metrics.rate_limited), 1);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(conn.resume_count(), 1);
    }

    // ===========================================
    // Teardown
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn close_schedules_unsubscribe() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.register(&conn, addr(1));

        h.proxy.handle(RelayEvent::Closed {
            conn_id: conn.id(),
            code: close_codes::NORMAL,
            reason: String::new(),
        });

        assert!(!h.proxy.is_registered(&addr(1)));
        // A finished handshake leaves no challenge behind
        assert!(h.recorder.take().is_empty());

        tokio::time::sleep(Duration::from_millis(INTERVAL_MS + 1)).await;
        h.pump();
        assert_eq!(
            h.recorder.take(),
            vec![WorkerMessage::Overlay(OverlayCommand::Unsubscribe(
                address_topic(&addr(1))
            ))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_subscription() {
        let mut h = harness();
        let conn = MockConnection::new();
        h.register(&conn, addr(1));
        h.proxy.handle(RelayEvent::Closed {
            conn_id: conn.id(),
            code: close_codes::NORMAL,
            reason: String::new(),
        });

        let again = MockConnection::new();
        h.register(&again, addr(1));

        tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 2)).await;
        h.pump();
        let posted = h.recorder.take();
        assert!(!posted
            .iter()
            .any(|m| matches!(m, WorkerMessage::Overlay(OverlayCommand::Unsubscribe(_)))));
    }

    #[tokio::test]
    async fn sweep_evicts_idle_and_closed() {
        let mut h = harness();
        let idle = MockConnection::new();
        let dead = MockConnection::new();
        h.register(&idle, addr(1));
        h.register(&dead, addr(2));
        h.clock.advance(30_000);
        let busy = MockConnection::new();
        h.register(&busy, addr(3));

        dead.drop_transport();
        h.clock.advance(31_000);

        assert_eq!(h.proxy.sweep(), 2);

        assert_eq!(idle.closed_with().map(|c| c.0), Some(close_codes::STALE));
        assert!(!h.proxy.is_registered(&addr(2)));
        assert!(h.proxy.is_registered(&addr(3)));
        assert_eq!(RelayMetrics::get(&h.metrics.evictions), 2);
    }

    #[tokio::test]
    async fn sweep_expires_buffered_messages() {
        let mut h = harness();
        let bob = MockConnection::new();
        h.register(&bob, addr(2));
        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![1])));
        assert_eq!(h.proxy.buffered_for(&addr(1)), 1);

        h.clock.advance(60_001);
        h.proxy.handle(RelayEvent::Cleanup);

        assert_eq!(h.proxy.buffered_for(&addr(1)), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let mut h = harness();
        let alice = MockConnection::new();
        let pending = MockConnection::new();
        h.register(&alice, addr(1));
        h.frame(&pending, &Message::init(addr(2), None));

        assert!(!h.proxy.handle(RelayEvent::Shutdown));

        assert!(h.recorder.killed());
        assert_eq!(alice.closed_with().map(|c| c.0), Some(close_codes::NORMAL));
        assert_eq!(pending.closed_with().map(|c| c.0), Some(close_codes::NORMAL));
        assert_eq!(h.proxy.registered_count(), 0);
        assert_eq!(h.proxy.pending_count(), 0);
    }

    // ===========================================
    // Overlay
    // ===========================================

    #[tokio::test]
    async fn remote_registration_relocates_and_forwards_buffer() {
        let mut h = harness();
        let alice = MockConnection::new();
        let bob = MockConnection::new();
        h.register(&alice, addr(1));
        h.register(&bob, addr(2));

        // Something is buffered for carol, who then shows up elsewhere
        let for_carol = Message::payload(addr(2), addr(3), vec![9]);
        h.output(&bob, Action::Send(for_carol.clone()));
        h.recorder.take();

        let remote = Address::from([0x77; 16]);
        h.overlay(NOTICE_TOPIC, Notice::registered(remote, addr(3)).encode());
        assert_eq!(
            published(&h.recorder.take()),
            vec![(address_topic(&addr(3)), for_carol.encode())]
        );
        assert_eq!(h.proxy.buffered_for(&addr(3)), 0);

        h.overlay(NOTICE_TOPIC, Notice::registered(remote, addr(1)).encode());
        assert_eq!(alice.closed_with().map(|c| c.0), Some(close_codes::RELOCATED));
        assert!(!h.proxy.is_registered(&addr(1)));
    }

    #[tokio::test]
    async fn own_notices_are_ignored() {
        let mut h = harness();
        let alice = MockConnection::new();
        h.register(&alice, addr(1));

        let own = Notice::registered(h.instance_id, addr(1)).encode();
        h.overlay(NOTICE_TOPIC, own);

        assert!(h.proxy.is_registered(&addr(1)));
        assert!(alice.is_open());
    }

    #[tokio::test]
    async fn remote_delivery_discards_buffer() {
        let mut h = harness();
        let bob = MockConnection::new();
        h.register(&bob, addr(2));
        h.output(&bob, Action::Send(Message::payload(addr(2), addr(1), vec![1])));

        let remote = Address::from([0x77; 16]);
        h.overlay(NOTICE_TOPIC, Notice::delivered(remote, addr(1)).encode());

        assert_eq!(h.proxy.buffered_for(&addr(1)), 0);
    }

    #[tokio::test]
    async fn forwarded_payload_reaches_local_recipient() {
        let mut h = harness();
        let alice = MockConnection::new();
        h.register(&alice, addr(1));

        let payload = Message::payload(addr(2), addr(1), b"via overlay".to_vec());
        h.overlay(&address_topic(&addr(1)), payload.encode());

        assert_eq!(alice.sent_messages(), vec![payload]);
        assert_eq!(
            published(&h.recorder.take()),
            vec![(
                NOTICE_TOPIC.to_string(),
                Notice::delivered(h.instance_id, addr(1)).encode()
            )]
        );
        assert_eq!(RelayMetrics::get(&h.metrics.overlay_received), 1);
    }

    #[tokio::test]
    async fn forwarded_payload_for_absent_recipient_is_held() {
        let mut h = harness();
        let payload = Message::payload(addr(2), addr(1), vec![1]);

        h.overlay(&address_topic(&addr(1)), payload.encode());
        // Wrong topic for the recipient
        h.overlay(&address_topic(&addr(5)), payload.encode());

        assert_eq!(h.proxy.buffered_for(&addr(1)), 1);
        assert!(published(&h.recorder.take()).is_empty());
    }
}
