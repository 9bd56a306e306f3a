//! Peer overlay boundary.
//!
//! Relay instances share a publish/subscribe overlay. Each registered
//! address has its own topic (the hex-encoded address), and one reserved
//! topic carries [`Notice`]s about registrations and deliveries.

mod local;

pub use local::{LocalHub, LocalOverlay};

use crate::error::OverlayError;
use async_trait::async_trait;
use waypost_types::{Address, ADDRESS_LEN};

/// Reserved topic for registration and delivery notices.
pub const NOTICE_TOPIC: &str = "waypost/notices";

/// Topic that carries forwarded payloads for `address`.
pub fn address_topic(address: &Address) -> String {
    address.to_hex()
}

/// A message received from the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEvent {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// Publish/subscribe network shared by relay instances.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Start receiving messages published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<(), OverlayError>;

    /// Stop receiving messages published on `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), OverlayError>;

    /// Publish `data` to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), OverlayError>;
}

/// What a [`Notice`] announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoticeKind {
    /// The address registered on the origin instance.
    Registered = 0x01,
    /// The origin instance delivered buffered traffic for the address.
    Delivered = 0x02,
}

/// Cross-instance notice carried on [`NOTICE_TOPIC`].
///
/// Layout: `[kind:u8][origin:16][address:16]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    /// Notice kind.
    pub kind: NoticeKind,
    /// Instance id of the publisher.
    pub origin: Address,
    /// Address the notice is about.
    pub address: Address,
}

impl Notice {
    /// Encoded size in bytes.
    pub const LEN: usize = 1 + ADDRESS_LEN + ADDRESS_LEN;

    /// Registration notice.
    pub fn registered(origin: Address, address: Address) -> Self {
        Self {
            kind: NoticeKind::Registered,
            origin,
            address,
        }
    }

    /// Delivery notice.
    pub fn delivered(origin: Address, address: Address) -> Self {
        Self {
            kind: NoticeKind::Delivered,
            origin,
            address,
        }
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(self.origin.as_bytes());
        bytes.extend_from_slice(self.address.as_bytes());
        bytes
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, OverlayError> {
        if bytes.len() != Self::LEN {
            return Err(OverlayError::MalformedNotice {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let kind = match bytes[0] {
            0x01 => NoticeKind::Registered,
            0x02 => NoticeKind::Delivered,
            other => return Err(OverlayError::UnknownNotice(other)),
        };
        let split = 1 + ADDRESS_LEN;
        let origin = Address::from_bytes(&bytes[1..split]).ok_or(OverlayError::MalformedNotice {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        let address = Address::from_bytes(&bytes[split..]).ok_or(OverlayError::MalformedNotice {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self {
            kind,
            origin,
            address,
        })
    }
}
