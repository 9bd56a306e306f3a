//! # waypost-core
//!
//! Pure logic for the waypost relay (no network I/O, instant tests).
//!
//! This crate implements the handshake state machine, the offline message
//! scheduler and the permission filter without any sockets or timers,
//! enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! Modules take input and produce output. Time is passed in explicitly
//! (or read through a [`Clock`]) and randomness comes from an injectable
//! [`ChallengeSource`], so every behaviour can be reproduced in a test.
//!
//! The actual I/O (connections, overlay, worker threads) is performed by
//! `waypost-relay`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod crypto;
pub mod permissions;
pub mod processor;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{meets_difficulty, sha256, verify_response, AuthError};
pub use permissions::{PermissionFilter, Verdict};
pub use processor::{
    Action, ChallengeSource, FixedChallenge, OsChallengeSource, Processor, DEFAULT_DIFFICULTY,
};
pub use scheduler::{MessageScheduler, ScheduledMessage, DEFAULT_LIMIT_SIZE, DEFAULT_TIMEFRAME_MS};
