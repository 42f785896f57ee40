//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - HKDF-SHA256 derivation of frame and ticket keys from the client UID
//! - ChaCha20 keystream application (frame obfuscation)
//! - ChaCha20-Poly1305 sealing (covert ticket)
//! - X25519 identity keys
//! - The process-wide session identifier source

mod aead;
mod kdf;
mod keys;

pub use aead::{Cipher, Keystream};
pub use kdf::{
    derive_ephemeral_seed, derive_frame_keys, derive_ticket_key, ticket_tag, verify_ticket_tag,
    FrameKeys, Hkdf, TAG_SALT_LEN,
};
pub use keys::{EphemeralKey, PublicKey, ServerKeyPair, Uid};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

static SESSION_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

/// Seed the session identifier source.
///
/// Call once at startup; later calls are ignored. A `None` seed draws from
/// OS entropy. If never called, the first `session_id()` seeds from entropy.
pub fn init_session_rng(seed: Option<u64>) {
    let _ = SESSION_RNG.get_or_init(|| Mutex::new(seeded(seed)));
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Draw a new session identifier.
///
/// Session ids are scoped to one UID and are not secret; they only need a
/// low collision probability.
pub fn session_id() -> u32 {
    SESSION_RNG
        .get_or_init(|| Mutex::new(seeded(None)))
        .lock()
        .gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_session_ids_vary() {
        init_session_rng(None);
        let ids: Vec<u32> = (0..16).map(|_| session_id()).collect();
        let first = ids[0];
        assert!(ids.iter().any(|&id| id != first));
    }
}
