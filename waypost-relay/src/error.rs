//! Error types for waypost-relay.

use crate::worker::WorkerKind;

/// Main error type for waypost-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Worker pool error.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Worker pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// More units requested than the machine can run in parallel.
    #[error("requested {requested} worker units but only {available} cores are available")]
    InsufficientParallelism {
        /// Units requested across all groups.
        requested: usize,
        /// Hardware parallelism.
        available: usize,
    },

    /// No units exist for the requested group.
    #[error("no {0:?} worker units available")]
    NoUnits(WorkerKind),

    /// The unit picked for dispatch has stopped.
    #[error("{0:?} worker unit stopped")]
    Disconnected(WorkerKind),

    /// A processor thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Transport layer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Overlay layer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    /// The overlay has shut down.
    #[error("overlay closed")]
    Closed,

    /// A registration notice could not be decoded.
    #[error("malformed notice: expected {expected} bytes, got {actual}")]
    MalformedNotice {
        /// Required length.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// A notice carried an unrecognised kind byte.
    #[error("unknown notice kind: {0:#04x}")]
    UnknownNotice(u8),
}
