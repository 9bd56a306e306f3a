//! # waypost-relay
//!
//! Store-and-forward relay server for waypost.
//!
//! This crate implements a relay server that:
//! - Authenticates clients with a proof-of-work gated challenge/response
//! - Routes opaque payloads between registered addresses
//! - Buffers payloads briefly for recipients that are offline
//! - Forwards through a peer overlay when the recipient sits on another relay
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                         ┌── Client B
//!            │       WebSocket         │
//!        ┌───┴─────────────────────────┴───┐
//!        │          Proxy (coordinator)    │
//!        │   ┌───────────┐  ┌───────────┐  │
//!        │   │ processor │  │  overlay  │  │
//!        │   │  threads  │  │   tasks   │  │
//!        │   └───────────┘  └─────┬─────┘  │
//!        └────────────────────────┼────────┘
//!                                 │ pub/sub
//!                          other relays
//! ```
//!
//! ## Protocol
//!
//! - INIT → CHALLENGE (difficulty mask + random challenge)
//! - RESPONSE → ACCEPTED (then any buffered payloads)
//! - PAYLOAD → delivered, buffered, or forwarded to the overlay

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod overlay;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod worker;
