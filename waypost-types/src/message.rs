//! The fixed-header binary frame exchanged with clients.
//!
//! Byte layout must match existing clients exactly:
//!
//! ```text
//! offset 0      type byte  (version << 4 | subtype)
//! offset 1..17  sender     (16 bytes)
//! offset 17..33 recipient  (16 bytes)
//! offset 33..   payload
//! ```

use crate::{Address, WireError, ADDRESS_LEN};

/// Protocol version carried in the high nibble of the type byte.
pub const VERSION: u8 = 1;

/// Length of the fixed header (type + sender + recipient).
pub const HEADER_LEN: usize = 1 + ADDRESS_LEN + ADDRESS_LEN;

/// Length of a server-issued challenge.
pub const CHALLENGE_LEN: usize = 16;

/// Length of the proof-of-work difficulty mask.
pub const DIFFICULTY_LEN: usize = 16;

/// Length of an uncompressed SEC1 P-256 public key.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Length of the proof-of-work nonce.
pub const NONCE_LEN: usize = 16;

/// Length of a raw `r || s` ECDSA-P256 signature.
pub const SIGNATURE_LEN: usize = 64;

const CHALLENGE_BODY_LEN: usize = DIFFICULTY_LEN + CHALLENGE_LEN;
const RESPONSE_BODY_LEN: usize = CHALLENGE_LEN + PUBLIC_KEY_LEN + NONCE_LEN + SIGNATURE_LEN;

/// Message subtype, the low nibble of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client opens a handshake
    Init = 0x00,
    /// Relay issues a proof-of-work challenge
    Challenge = 0x01,
    /// Client answers the challenge
    Response = 0x02,
    /// Relay confirms registration
    Accepted = 0x03,
    /// Opaque client-to-client payload
    Payload = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Init),
            0x01 => Ok(MessageType::Challenge),
            0x02 => Ok(MessageType::Response),
            0x03 => Ok(MessageType::Accepted),
            0x04 => Ok(MessageType::Payload),
            _ => Err(WireError::InvalidMessageType(value)),
        }
    }
}

impl MessageType {
    /// Minimum payload length for this subtype.
    fn min_payload_len(self) -> usize {
        match self {
            MessageType::Challenge => CHALLENGE_BODY_LEN,
            MessageType::Response => RESPONSE_BODY_LEN,
            MessageType::Init | MessageType::Accepted | MessageType::Payload => 0,
        }
    }
}

/// A decoded waypost frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version (high nibble)
    pub version: u8,
    /// Subtype (low nibble)
    pub kind: MessageType,
    /// Claimed sender
    pub sender: Address,
    /// Intended recipient
    pub recipient: Address,
    /// Subtype-specific payload, opaque for [`MessageType::Payload`]
    pub payload: Vec<u8>,
}

impl Message {
    fn new(kind: MessageType, sender: Address, recipient: Address, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            kind,
            sender,
            recipient,
            payload,
        }
    }

    /// Build an `init` frame, optionally carrying connection-scoped permissions.
    pub fn init(sender: Address, permissions: Option<&InitPermissions>) -> Self {
        let payload = permissions.map(InitPermissions::encode).unwrap_or_default();
        Self::new(MessageType::Init, sender, Address::EMPTY, payload)
    }

    /// Build a `challenge` frame addressed to `recipient`.
    pub fn challenge(
        recipient: Address,
        difficulty: [u8; DIFFICULTY_LEN],
        challenge: [u8; CHALLENGE_LEN],
    ) -> Self {
        let mut payload = Vec::with_capacity(CHALLENGE_BODY_LEN);
        payload.extend_from_slice(&difficulty);
        payload.extend_from_slice(&challenge);
        Self::new(MessageType::Challenge, Address::EMPTY, recipient, payload)
    }

    /// Build a `response` frame from its fields.
    pub fn response(sender: Address, body: &ResponseBody) -> Self {
        let mut payload = Vec::with_capacity(RESPONSE_BODY_LEN);
        payload.extend_from_slice(&body.challenge);
        payload.extend_from_slice(&body.public_key);
        payload.extend_from_slice(&body.nonce);
        payload.extend_from_slice(&body.signature);
        Self::new(MessageType::Response, sender, Address::EMPTY, payload)
    }

    /// Build an `accepted` frame addressed to `recipient`.
    pub fn accepted(recipient: Address) -> Self {
        Self::new(MessageType::Accepted, Address::EMPTY, recipient, Vec::new())
    }

    /// Build a `payload` frame.
    pub fn payload(sender: Address, recipient: Address, data: Vec<u8>) -> Self {
        Self::new(MessageType::Payload, sender, recipient, data)
    }

    /// The packed type byte (`version << 4 | subtype`).
    pub fn type_byte(&self) -> u8 {
        (self.version << 4) | (self.kind as u8)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.type_byte());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Deserialize from wire bytes.
    ///
    /// Fails if the header is incomplete, the subtype is unknown, or a
    /// challenge/response payload is shorter than its fixed layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let version = bytes[0] >> 4;
        let kind = MessageType::try_from(bytes[0] & 0x0f)?;
        let sender = read_address(&bytes[1..1 + ADDRESS_LEN]);
        let recipient = read_address(&bytes[1 + ADDRESS_LEN..HEADER_LEN]);
        let payload = &bytes[HEADER_LEN..];

        let min = kind.min_payload_len();
        if payload.len() < min {
            return Err(WireError::TooShort {
                expected: HEADER_LEN + min,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            version,
            kind,
            sender,
            recipient,
            payload: payload.to_vec(),
        })
    }

    /// Split a `challenge` payload into difficulty and challenge.
    pub fn parse_challenge(&self) -> Result<ChallengeBody, WireError> {
        let p = require(&self.payload, CHALLENGE_BODY_LEN)?;
        Ok(ChallengeBody {
            difficulty: fixed(&p[..DIFFICULTY_LEN]),
            challenge: fixed(&p[DIFFICULTY_LEN..CHALLENGE_BODY_LEN]),
        })
    }

    /// Split a `response` payload into its four fields.
    pub fn parse_response(&self) -> Result<ResponseBody, WireError> {
        let p = require(&self.payload, RESPONSE_BODY_LEN)?;
        let (challenge, rest) = p.split_at(CHALLENGE_LEN);
        let (public_key, rest) = rest.split_at(PUBLIC_KEY_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        Ok(ResponseBody {
            challenge: fixed(challenge),
            public_key: fixed(public_key),
            nonce: fixed(nonce),
            signature: fixed(&rest[..SIGNATURE_LEN]),
        })
    }

    /// Permission lists carried by an `init` payload, if any.
    pub fn parse_permissions(&self) -> Result<Option<InitPermissions>, WireError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        InitPermissions::decode(&self.payload).map(Some)
    }
}

/// Fields of a `challenge` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeBody {
    /// Byte-wise proof-of-work threshold
    pub difficulty: [u8; DIFFICULTY_LEN],
    /// Random server nonce the client must bind into its response
    pub challenge: [u8; CHALLENGE_LEN],
}

/// Fields of a `response` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseBody {
    /// Echo of the issued challenge
    pub challenge: [u8; CHALLENGE_LEN],
    /// Uncompressed SEC1 P-256 public key
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Proof-of-work nonce
    pub nonce: [u8; NONCE_LEN],
    /// `r || s` signature over SHA-256(challenge || public_key || nonce)
    pub signature: [u8; SIGNATURE_LEN],
}

/// Connection-scoped allow/deny lists supplied in an `init` payload.
///
/// Layout: `[allow_count:u8][allow_count * 16][deny_count:u8][deny_count * 16]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitPermissions {
    /// Addresses allowed to reach this connection
    pub allow: Vec<Address>,
    /// Addresses always rejected
    pub deny: Vec<Address>,
}

impl InitPermissions {
    /// Serialize to the `init` payload layout.
    ///
    /// Lists longer than 255 entries are truncated.
    pub fn encode(&self) -> Vec<u8> {
        let allow = &self.allow[..self.allow.len().min(u8::MAX as usize)];
        let deny = &self.deny[..self.deny.len().min(u8::MAX as usize)];
        let mut out = Vec::with_capacity(2 + (allow.len() + deny.len()) * ADDRESS_LEN);
        out.push(allow.len() as u8);
        allow.iter().for_each(|a| out.extend_from_slice(a.as_bytes()));
        out.push(deny.len() as u8);
        deny.iter().for_each(|a| out.extend_from_slice(a.as_bytes()));
        out
    }

    /// Parse the `init` payload layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (allow, rest) = read_list(bytes)?;
        let (deny, _) = read_list(rest)?;
        Ok(Self { allow, deny })
    }
}

fn read_list(bytes: &[u8]) -> Result<(Vec<Address>, &[u8]), WireError> {
    let count = *bytes.first().ok_or(WireError::TooShort {
        expected: 1,
        actual: 0,
    })? as usize;
    let body = &bytes[1..];
    let len = count * ADDRESS_LEN;
    if body.len() < len {
        return Err(WireError::TooShort {
            expected: len + 1,
            actual: bytes.len(),
        });
    }
    let list = body[..len].chunks_exact(ADDRESS_LEN).map(read_address).collect();
    Ok((list, &body[len..]))
}

fn require(payload: &[u8], len: usize) -> Result<&[u8], WireError> {
    if payload.len() < len {
        return Err(WireError::TooShort {
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

fn read_address(bytes: &[u8]) -> Address {
    Address::from(fixed::<ADDRESS_LEN>(bytes))
}

/// Copy a slice whose length the caller has already checked.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
