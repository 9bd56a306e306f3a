//! Worker pool.
//!
//! Two groups of units run beside the coordinator:
//!
//! - **Processor** units are OS threads running the handshake
//!   [`Processor`]. Signature and hash checks stay off the coordinator.
//! - **Overlay** units are tokio tasks that own the [`Overlay`] handle.
//!   They execute subscribe/unsubscribe/publish commands and forward
//!   inbound overlay traffic.
//!
//! Commands go out by value over unbounded channels, one per unit.
//! Commands that must stay ordered carry an affinity key and always land
//! on the same unit: handshake steps key on the sender, overlay commands
//! on the address topic they concern. Everything else is picked
//! round-robin. Results come back through the handler each group was
//! built with.

use crate::error::WorkerError;
use crate::overlay::{address_topic, Notice, Overlay, OverlayEvent, NOTICE_TOPIC};
use crate::transport::ConnectionId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use waypost_core::{Action, Processor};
use waypost_types::{Address, Message, MessageType};

/// Worker group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Handshake verification.
    Processor,
    /// Peer overlay I/O.
    Overlay,
}

/// Work for a processor unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorCommand {
    /// Run a decoded message through the processor.
    Process {
        /// Connection the message arrived on.
        conn_id: ConnectionId,
        /// The message.
        message: Message,
    },
    /// Drop handshake state for a closed connection.
    Closed {
        /// Address bound to the closed connection.
        address: Address,
    },
}

/// Work for an overlay unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayCommand {
    /// Subscribe to a topic.
    Subscribe(String),
    /// Unsubscribe from a topic.
    Unsubscribe(String),
    /// Publish bytes on a topic.
    Publish {
        /// Target topic.
        topic: String,
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// Publish a notice on [`NOTICE_TOPIC`].
    Announce(Notice),
}

impl ProcessorCommand {
    /// Handshake steps for one sender run on one unit, in posting order.
    /// Payloads carry no handshake state and go to any unit.
    fn affinity(&self) -> Option<u64> {
        match self {
            Self::Process { message, .. } => match message.kind {
                MessageType::Init | MessageType::Response => Some(hash_key(&message.sender)),
                _ => None,
            },
            Self::Closed { address } => Some(hash_key(address)),
        }
    }
}

impl OverlayCommand {
    /// Commands about one address share a unit, so a subscription is in
    /// place before the notice announcing it goes out.
    fn affinity(&self) -> u64 {
        match self {
            Self::Subscribe(topic) | Self::Unsubscribe(topic) => hash_key(topic),
            Self::Publish { topic, .. } => hash_key(topic),
            Self::Announce(notice) => hash_key(&address_topic(&notice.address)),
        }
    }
}

fn hash_key(key: &(impl Hash + ?Sized)) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A command addressed to one worker group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// For a processor unit.
    Processor(ProcessorCommand),
    /// For an overlay unit.
    Overlay(OverlayCommand),
}

impl WorkerMessage {
    /// Group this message is dispatched to.
    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::Processor(_) => WorkerKind::Processor,
            Self::Overlay(_) => WorkerKind::Overlay,
        }
    }
}

impl From<ProcessorCommand> for WorkerMessage {
    fn from(command: ProcessorCommand) -> Self {
        Self::Processor(command)
    }
}

impl From<OverlayCommand> for WorkerMessage {
    fn from(command: OverlayCommand) -> Self {
        Self::Overlay(command)
    }
}

/// Processor result, tagged with the originating connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOutput {
    /// Connection the triggering message arrived on.
    pub conn_id: ConnectionId,
    /// What the coordinator should do.
    pub action: Action,
}

/// Called on a processor thread for every produced action.
pub type ProcessorHandler = Arc<dyn Fn(ProcessorOutput) + Send + Sync>;

/// Called on an overlay task for every inbound overlay message.
pub type OverlayHandler = Arc<dyn Fn(OverlayEvent) + Send + Sync>;

/// Something that accepts worker commands.
///
/// The coordinator only talks to workers through this trait, so tests can
/// substitute a [`RecordingDispatcher`].
pub trait Dispatcher: Send + 'static {
    /// Hand a command to the next unit of its group.
    fn post(&self, message: WorkerMessage) -> Result<(), WorkerError>;

    /// Stop every unit. In-flight commands may be dropped.
    fn kill(&mut self);
}

/// Everything needed to start a [`WorkerPool`].
pub struct WorkerSetup {
    /// Number of processor units.
    pub processors: usize,
    /// Number of overlay units.
    pub overlays: usize,
    /// Processor shared by all processor units.
    pub processor: Arc<Processor>,
    /// Overlay handle shared by all overlay units.
    pub overlay: Arc<dyn Overlay>,
    /// Inbound overlay traffic, drained by the first overlay unit.
    pub overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
    /// Receives processor results.
    pub on_processed: ProcessorHandler,
    /// Receives inbound overlay messages.
    pub on_overlay_event: OverlayHandler,
}

enum UnitHandle {
    Thread(thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

struct Group<T> {
    units: Vec<(mpsc::UnboundedSender<T>, UnitHandle)>,
    cursor: AtomicUsize,
}

impl<T> Group<T> {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Send to the unit owning `affinity`, or to the next unit in turn.
    fn post(
        &self,
        kind: WorkerKind,
        command: T,
        affinity: Option<u64>,
    ) -> Result<(), WorkerError> {
        if self.units.is_empty() {
            return Err(WorkerError::NoUnits(kind));
        }
        let len = self.units.len();
        let index = match affinity {
            Some(key) => (key % len as u64) as usize,
            None => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
        };
        self.units[index]
            .0
            .send(command)
            .map_err(|_| WorkerError::Disconnected(kind))
    }

    fn kill(&mut self) {
        for (tx, handle) in self.units.drain(..) {
            drop(tx);
            match handle {
                // Threads exit once their channel closes; nothing waits on them
                UnitHandle::Thread(_) => {}
                UnitHandle::Task(task) => task.abort(),
            }
        }
    }
}

/// Fixed pool of processor and overlay units.
pub struct WorkerPool {
    processors: Group<ProcessorCommand>,
    overlays: Group<OverlayCommand>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("processors", &self.processors.units.len())
            .field("overlays", &self.overlays.units.len())
            .finish()
    }
}

impl WorkerPool {
    /// Start the pool, sized against the machine's parallelism.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(setup: WorkerSetup) -> Result<Self, WorkerError> {
        let available = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::start_with_parallelism(setup, available)
    }

    /// Start the pool against an explicit parallelism ceiling.
    pub fn start_with_parallelism(
        setup: WorkerSetup,
        available: usize,
    ) -> Result<Self, WorkerError> {
        let requested = setup.processors + setup.overlays;
        if requested > available {
            return Err(WorkerError::InsufficientParallelism {
                requested,
                available,
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        let mut pool = Self {
            processors: Group::new(),
            overlays: Group::new(),
        };

        for index in 0..setup.processors {
            let (tx, rx) = mpsc::unbounded_channel();
            let processor = setup.processor.clone();
            let handler = setup.on_processed.clone();
            let spawned = thread::Builder::new()
                .name(format!("waypost-processor-{}", index))
                .spawn(move || run_processor_unit(processor, rx, handler));
            match spawned {
                Ok(handle) => pool.processors.units.push((tx, UnitHandle::Thread(handle))),
                Err(e) => {
                    pool.kill();
                    return Err(WorkerError::Spawn(e.to_string()));
                }
            }
        }

        let mut overlay_events = Some(setup.overlay_events);
        for index in 0..setup.overlays {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = runtime.spawn(run_overlay_unit(
                index,
                setup.overlay.clone(),
                rx,
                overlay_events.take(),
                setup.on_overlay_event.clone(),
            ));
            pool.overlays.units.push((tx, UnitHandle::Task(task)));
        }

        tracing::info!(
            "Worker pool started ({} processor, {} overlay units)",
            setup.processors,
            setup.overlays
        );
        Ok(pool)
    }

    /// Number of live units in a group.
    pub fn unit_count(&self, kind: WorkerKind) -> usize {
        match kind {
            WorkerKind::Processor => self.processors.units.len(),
            WorkerKind::Overlay => self.overlays.units.len(),
        }
    }
}

impl Dispatcher for WorkerPool {
    fn post(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        match message {
            WorkerMessage::Processor(command) => {
                let affinity = command.affinity();
                self.processors.post(WorkerKind::Processor, command, affinity)
            }
            WorkerMessage::Overlay(command) => {
                let affinity = command.affinity();
                self.overlays.post(WorkerKind::Overlay, command, Some(affinity))
            }
        }
    }

    fn kill(&mut self) {
        self.processors.kill();
        self.overlays.kill();
        tracing::info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.processors.kill();
        self.overlays.kill();
    }
}

fn run_processor_unit(
    processor: Arc<Processor>,
    mut rx: mpsc::UnboundedReceiver<ProcessorCommand>,
    handler: ProcessorHandler,
) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            ProcessorCommand::Process { conn_id, message } => {
                if let Some(action) = processor.process_message(&message) {
                    handler(ProcessorOutput { conn_id, action });
                }
            }
            ProcessorCommand::Closed { address } => processor.on_closed(&address),
        }
    }
}

async fn run_overlay_unit(
    index: usize,
    overlay: Arc<dyn Overlay>,
    mut rx: mpsc::UnboundedReceiver<OverlayCommand>,
    mut events: Option<mpsc::UnboundedReceiver<OverlayEvent>>,
    handler: OverlayHandler,
) {
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => execute_overlay_command(index, overlay.as_ref(), command).await,
                None => break,
            },
            Some(event) = recv_event(&mut events) => handler(event),
        }
    }
}

async fn recv_event(
    events: &mut Option<mpsc::UnboundedReceiver<OverlayEvent>>,
) -> Option<OverlayEvent> {
    match events {
        Some(rx) => {
            let event = rx.recv().await;
            if event.is_none() {
                *events = None;
            }
            event
        }
        None => std::future::pending().await,
    }
}

async fn execute_overlay_command(index: usize, overlay: &dyn Overlay, command: OverlayCommand) {
    let result = match &command {
        OverlayCommand::Subscribe(topic) => overlay.subscribe(topic).await,
        OverlayCommand::Unsubscribe(topic) => overlay.unsubscribe(topic).await,
        OverlayCommand::Publish { topic, data } => overlay.publish(topic, data.clone()).await,
        OverlayCommand::Announce(notice) => overlay.publish(NOTICE_TOPIC, notice.encode()).await,
    };
    if let Err(e) = result {
        tracing::warn!("Overlay unit {}: {:?} failed: {}", index, command, e);
    }
}

/// Dispatcher that records commands instead of running them.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    posted: Vec<WorkerMessage>,
    killed: bool,
}

impl RecordingDispatcher {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything posted so far.
    pub fn take(&self) -> Vec<WorkerMessage> {
        std::mem::take(&mut self.lock().posted)
    }

    /// Whether `kill()` was called.
    pub fn killed(&self) -> bool {
        self.lock().killed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Dispatcher for RecordingDispatcher {
    fn post(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        let mut inner = self.lock();
        if inner.killed {
            return Err(WorkerError::NoUnits(message.kind()));
        }
        inner.posted.push(message);
        Ok(())
    }

    fn kill(&mut self) {
        self.lock().killed = true;
    }
}
