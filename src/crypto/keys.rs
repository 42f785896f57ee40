//! Identity material: client UID and X25519 keys

use super::{random_bytes, CryptoError, KEY_LEN};
use base64::Engine;
use std::fmt;
use x25519_dalek::StaticSecret;

fn decode_base64(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Per-client identity.
///
/// Derives the frame keys and the ticket ephemeral key. The same UID must be
/// reused across reconnects so the server can group connections.
#[derive(Clone, PartialEq, Eq)]
pub struct Uid(Vec<u8>);

impl Uid {
    /// Accepted UID lengths in bytes
    pub const LENGTHS: [usize; 2] = [16, 32];

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if !Self::LENGTHS.contains(&bytes.len()) {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_base64(s)?)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid([REDACTED; {}])", self.0.len())
    }
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_base64(s)?)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Client ephemeral key carried in the session ticket
pub struct EphemeralKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKey {
    /// Build from a 32-byte seed (see `derive_ephemeral_seed`)
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// X25519 agreement with the server's static key
    pub fn agree(&self, server: &PublicKey) -> [u8; KEY_LEN] {
        self.secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(server.0))
            .to_bytes()
    }
}

/// Server static key pair.
///
/// The client only ever holds the public half; the pair exists so a server
/// (or a test peer) can open tickets.
pub struct ServerKeyPair {
    secret: StaticSecret,
    pub public: PublicKey,
}

impl ServerKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut seed = [0u8; KEY_LEN];
        random_bytes(&mut seed);
        Self::from_secret_bytes(seed)
    }

    /// Rebuild from the 32-byte secret
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// X25519 agreement with a client ephemeral key
    pub fn agree(&self, client: &PublicKey) -> [u8; KEY_LEN] {
        self.secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(client.0))
            .to_bytes()
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerKeyPair({:?}, [REDACTED])", self.public)
    }
}
