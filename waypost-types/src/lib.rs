//! # waypost-types
//!
//! Wire format types for the waypost relay protocol.
//!
//! This crate provides the foundational types used across all waypost crates:
//! - [`Address`] - 16-byte participant identifier derived from a public key
//! - [`Message`] / [`MessageType`] - the fixed-header binary frame
//! - [`ChallengeBody`], [`ResponseBody`], [`InitPermissions`] - subtype layouts
//! - [`WireError`] - decode failures
//!
//! ## Frame layout
//!
//! ```text
//! [1-byte type][16-byte sender][16-byte recipient][variable payload]
//!   high nibble: protocol version (1)
//!   low nibble:  subtype (init=0, challenge=1, response=2, accepted=3, payload=4)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod error;
mod message;

pub use address::{Address, ADDRESS_LEN};
pub use error::WireError;
pub use message::{
    ChallengeBody, InitPermissions, Message, MessageType, ResponseBody, CHALLENGE_LEN,
    DIFFICULTY_LEN, HEADER_LEN, NONCE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN, VERSION,
};
