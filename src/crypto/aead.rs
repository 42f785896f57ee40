//! ChaCha20 based primitives
//!
//! `Cipher` seals and opens the covert ticket with ChaCha20-Poly1305.
//! `Keystream` XORs raw ChaCha20 keystream into a buffer for frame
//! obfuscation, where output must be exactly as long as input.

use super::{CryptoError, KEY_LEN, NONCE_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher with caller-supplied nonces
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt data, returning ciphertext with appended tag
    pub fn seal(
        &self,
        nonce: [u8; NONCE_LEN],
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        Ok(buffer)
    }

    /// Decrypt data, verifying the auth tag
    pub fn open(
        &self,
        nonce: [u8; NONCE_LEN],
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

/// Raw ChaCha20 keystream under a fixed key.
///
/// ChaCha20-Poly1305 encrypts by XORing the ChaCha20 keystream, so sealing
/// with the tag discarded is a length-preserving involution: applying it
/// twice with the same nonce restores the input.
pub struct Keystream {
    key: LessSafeKey,
}

impl Keystream {
    /// Create a keystream from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// XOR the keystream for `nonce` into `buf`
    pub fn apply(&self, nonce: [u8; NONCE_LEN], buf: &mut [u8]) -> Result<(), CryptoError> {
        self.key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), buf)
            .map(|_tag| ())
            .map_err(|_| CryptoError::Encryption("keystream failed".to_string()))
    }
}
