//! Response verification for the challenge handshake.
//!
//! A response is accepted only if, in order:
//! 1. the echoed challenge matches the one issued,
//! 2. SHA-256(public key) truncated to 16 bytes equals the claimed sender,
//! 3. every byte of `h = SHA-256(challenge || public_key || nonce)` is
//!    dominated by the difficulty mask at the same position,
//! 4. the ECDSA-P256 signature over `h` verifies.
//!
//! The difficulty rule is byte-wise, not a numeric comparison. Clients
//! search nonces against exactly this rule.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use waypost_types::{Address, ResponseBody, CHALLENGE_LEN, DIFFICULTY_LEN};

/// Reasons a handshake response is rejected.
///
/// Recorded in logs only; the client never learns which check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No challenge is outstanding for the sender.
    #[error("challenge not found")]
    UnknownChallenge,

    /// Echoed challenge differs from the issued one.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// Public key does not hash to the claimed sender.
    #[error("public key does not match sender address")]
    AddressMismatch,

    /// Proof-of-work hash is not dominated by the difficulty mask.
    #[error("difficulty too low")]
    DifficultyTooLow,

    /// Public key is not a valid SEC1 P-256 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature is malformed or does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Response payload could not be split into its fields.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// OS randomness was unavailable while issuing a challenge.
    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// True if `difficulty[i] >= hash[i]` for every position of the mask.
pub fn meets_difficulty(hash: &[u8], difficulty: &[u8; DIFFICULTY_LEN]) -> bool {
    hash.len() >= DIFFICULTY_LEN && difficulty.iter().zip(hash).all(|(d, h)| d >= h)
}

/// Run the four acceptance checks against an issued challenge.
pub fn verify_response(
    issued: &[u8; CHALLENGE_LEN],
    sender: &Address,
    body: &ResponseBody,
    difficulty: &[u8; DIFFICULTY_LEN],
) -> Result<(), AuthError> {
    if &body.challenge != issued {
        return Err(AuthError::ChallengeMismatch);
    }

    if Address::from_public_key(&body.public_key) != *sender {
        return Err(AuthError::AddressMismatch);
    }

    let mut hasher = Sha256::new();
    hasher.update(issued);
    hasher.update(body.public_key);
    hasher.update(body.nonce);
    let hash: [u8; 32] = hasher.finalize().into();

    if !meets_difficulty(&hash, difficulty) {
        return Err(AuthError::DifficultyTooLow);
    }

    let key = VerifyingKey::from_sec1_bytes(&body.public_key)
        .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;
    let signature =
        Signature::from_slice(&body.signature).map_err(|_| AuthError::InvalidSignature)?;
    key.verify_prehash(&hash, &signature)
        .map_err(|_| AuthError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use waypost_types::{NONCE_LEN, PUBLIC_KEY_LEN};

    const CHALLENGE: [u8; CHALLENGE_LEN] = [7u8; CHALLENGE_LEN];
    const EASY: [u8; DIFFICULTY_LEN] = [0xff; DIFFICULTY_LEN];

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[0x11; 32]).unwrap()
    }

    fn public_key(key: &SigningKey) -> [u8; PUBLIC_KEY_LEN] {
        let point = key.verifying_key().to_encoded_point(false);
        point.as_bytes().try_into().unwrap()
    }

    fn signed_body(key: &SigningKey, nonce: [u8; NONCE_LEN]) -> ResponseBody {
        let public_key = public_key(key);
        let mut input = Vec::new();
        input.extend_from_slice(&CHALLENGE);
        input.extend_from_slice(&public_key);
        input.extend_from_slice(&nonce);
        let hash = sha256(&input);
        let signature: Signature = key.sign_prehash(&hash).unwrap();
        ResponseBody {
            challenge: CHALLENGE,
            public_key,
            nonce,
            signature: signature.to_bytes().as_slice().try_into().unwrap(),
        }
    }

    #[test]
    fn difficulty_is_bytewise() {
        let mask = [0x80; DIFFICULTY_LEN];
        let mut hash = [0x10u8; 32];
        assert!(meets_difficulty(&hash, &mask));

        // Only the first 16 bytes are compared
        hash[20] = 0xff;
        assert!(meets_difficulty(&hash, &mask));

        // A single byte over the mask fails even if the number is smaller
        hash[0] = 0x00;
        hash[15] = 0x81;
        assert!(!meets_difficulty(&hash, &mask));
    }

    #[test]
    fn all_ff_mask_accepts_everything() {
        assert!(meets_difficulty(&[0xff; 32], &EASY));
        assert!(!meets_difficulty(&[0xff; 8], &EASY));
    }

    #[test]
    fn valid_response_verifies() {
        let key = signing_key();
        let body = signed_body(&key, [1; NONCE_LEN]);
        let sender = Address::from_public_key(&body.public_key);

        assert_eq!(verify_response(&CHALLENGE, &sender, &body, &EASY), Ok(()));
    }

    #[test]
    fn challenge_mismatch_rejected() {
        let key = signing_key();
        let body = signed_body(&key, [1; NONCE_LEN]);
        let sender = Address::from_public_key(&body.public_key);

        assert_eq!(
            verify_response(&[8; CHALLENGE_LEN], &sender, &body, &EASY),
            Err(AuthError::ChallengeMismatch)
        );
    }

    #[test]
    fn foreign_address_rejected() {
        let key = signing_key();
        let body = signed_body(&key, [1; NONCE_LEN]);

        assert_eq!(
            verify_response(&CHALLENGE, &Address::from([3; 16]), &body, &EASY),
            Err(AuthError::AddressMismatch)
        );
    }

    #[test]
    fn zero_mask_rejects_proof_of_work() {
        let key = signing_key();
        let body = signed_body(&key, [1; NONCE_LEN]);
        let sender = Address::from_public_key(&body.public_key);

        assert_eq!(
            verify_response(&CHALLENGE, &sender, &body, &[0; DIFFICULTY_LEN]),
            Err(AuthError::DifficultyTooLow)
        );
    }

    #[test]
    fn partial_mask_needs_nonce_search() {
        let key = signing_key();
        let mut mask = EASY;
        mask[0] = 0x7f;

        let body = (0u8..=255)
            .map(|i| signed_body(&key, [i; NONCE_LEN]))
            .find(|b| {
                let mut input = Vec::new();
                input.extend_from_slice(&b.challenge);
                input.extend_from_slice(&b.public_key);
                input.extend_from_slice(&b.nonce);
                meets_difficulty(&sha256(&input), &mask)
            })
            .expect("a nonce below the mask within 256 tries");
        let sender = Address::from_public_key(&body.public_key);

        assert_eq!(verify_response(&CHALLENGE, &sender, &body, &mask), Ok(()));
    }

    #[test]
    fn tampered_signature_rejected() {
        let key = signing_key();
        let mut body = signed_body(&key, [1; NONCE_LEN]);
        body.signature[10] ^= 0x01;
        let sender = Address::from_public_key(&body.public_key);

        assert_eq!(
            verify_response(&CHALLENGE, &sender, &body, &EASY),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn invalid_point_rejected() {
        let key = signing_key();
        let mut body = signed_body(&key, [1; NONCE_LEN]);
        body.public_key = [0x04; PUBLIC_KEY_LEN];
        let sender = Address::from_public_key(&body.public_key);

        assert!(matches!(
            verify_response(&CHALLENGE, &sender, &body, &EASY),
            Err(AuthError::InvalidPublicKey(_))
        ));
    }
}
