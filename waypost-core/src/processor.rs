//! Handshake state machine and message classifier.
//!
//! [`Processor::process_message`] maps one decoded frame to at most one
//! [`Action`]. The caller (the relay coordinator) is responsible for
//! executing it: writing replies, registering connections, routing
//! payloads.
//!
//! Challenge records live in a concurrent map, so one `Processor` can be
//! shared by every processor unit. An `init` and its `response` may land
//! on different units and still meet the same record.

use dashmap::DashMap;
use waypost_types::{Address, Message, MessageType, CHALLENGE_LEN, DIFFICULTY_LEN, VERSION};

use crate::crypto::{verify_response, AuthError};

/// Difficulty mask used unless configured otherwise (accepts every hash).
pub const DEFAULT_DIFFICULTY: [u8; DIFFICULTY_LEN] = [0xff; DIFFICULTY_LEN];

/// What the coordinator should do with a processed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Handshake succeeded: register `sender` and send `reply` to it.
    Register {
        /// Authenticated address.
        sender: Address,
        /// The `accepted` frame.
        reply: Message,
    },
    /// Write the frame back to the originating connection.
    Respond(Message),
    /// Route a payload to its recipient.
    Send(Message),
}

/// Source of challenge bytes.
pub trait ChallengeSource: Send + Sync + 'static {
    /// Produce a fresh challenge.
    fn next_challenge(&self) -> Result<[u8; CHALLENGE_LEN], AuthError>;
}

/// Challenges from the OS entropy pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsChallengeSource;

impl ChallengeSource for OsChallengeSource {
    fn next_challenge(&self) -> Result<[u8; CHALLENGE_LEN], AuthError> {
        let mut bytes = [0u8; CHALLENGE_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Entropy(e.to_string()))?;
        Ok(bytes)
    }
}

/// Always issues the same challenge. Test use only.
#[derive(Debug, Clone, Copy)]
pub struct FixedChallenge(pub [u8; CHALLENGE_LEN]);

impl ChallengeSource for FixedChallenge {
    fn next_challenge(&self) -> Result<[u8; CHALLENGE_LEN], AuthError> {
        Ok(self.0)
    }
}

/// The version-1 handshake processor.
pub struct Processor {
    difficulty: [u8; DIFFICULTY_LEN],
    challenges: DashMap<Address, [u8; CHALLENGE_LEN]>,
    source: Box<dyn ChallengeSource>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("difficulty", &self.difficulty)
            .field("pending_challenges", &self.challenges.len())
            .finish()
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY)
    }
}

impl Processor {
    /// Create a processor issuing OS-random challenges.
    pub fn new(difficulty: [u8; DIFFICULTY_LEN]) -> Self {
        Self::with_source(difficulty, OsChallengeSource)
    }

    /// Create a processor with a custom challenge source.
    pub fn with_source(difficulty: [u8; DIFFICULTY_LEN], source: impl ChallengeSource) -> Self {
        Self {
            difficulty,
            challenges: DashMap::new(),
            source: Box::new(source),
        }
    }

    /// Difficulty mask sent with every challenge.
    pub fn difficulty(&self) -> &[u8; DIFFICULTY_LEN] {
        &self.difficulty
    }

    /// Number of outstanding challenges.
    pub fn pending_challenges(&self) -> usize {
        self.challenges.len()
    }

    /// Classify one frame and advance the handshake.
    ///
    /// Returns `None` for frames of another version, for client-bound
    /// subtypes, and for every failed or unknown response.
    pub fn process_message(&self, message: &Message) -> Option<Action> {
        if message.version != VERSION {
            tracing::debug!("Ignoring frame with version {}", message.version);
            return None;
        }

        match message.kind {
            MessageType::Init => self.on_init(message),
            MessageType::Response => self.on_response(message),
            MessageType::Payload => Some(Action::Send(message.clone())),
            MessageType::Challenge | MessageType::Accepted => None,
        }
    }

    /// Drop any challenge outstanding for `sender`. Idempotent.
    pub fn on_closed(&self, sender: &Address) {
        self.challenges.remove(sender);
    }

    fn on_init(&self, message: &Message) -> Option<Action> {
        let challenge = match self.source.next_challenge() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Could not issue challenge for {}: {}", message.sender, e);
                return None;
            }
        };

        self.challenges.insert(message.sender, challenge);
        Some(Action::Respond(Message::challenge(
            message.sender,
            self.difficulty,
            challenge,
        )))
    }

    fn on_response(&self, message: &Message) -> Option<Action> {
        let sender = message.sender;
        let result = self
            .challenges
            .remove(&sender)
            .ok_or(AuthError::UnknownChallenge)
            .and_then(|(_, issued)| {
                let body = message
                    .parse_response()
                    .map_err(|e| AuthError::Malformed(e.to_string()))?;
                verify_response(&issued, &sender, &body, &self.difficulty)
            });

        match result {
            Ok(()) => {
                tracing::debug!("Challenge verification for {} passed", sender);
                Some(Action::Register {
                    sender,
                    reply: Message::accepted(sender),
                })
            }
            Err(e) => {
                tracing::warn!("Challenge verification for {} failed: {}", sender, e);
                None
            }
        }
    }
}
