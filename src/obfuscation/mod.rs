//! Traffic obfuscation layer
//!
//! Provides:
//! - Browser fingerprint profiles for the camouflage ClientHello
//! - The identity-keyed frame transform applied to every record body
//!
//! ## Frame transform
//!
//! ```text
//! plaintext:  header(12) | payload
//! payload'  = payload ^ KS(payload_key, nonce = header)
//! header'   = header  ^ KS(header_key,  nonce = last 12 bytes of payload')
//! ```
//!
//! Payloads shorter than 12 bytes are left-padded with zeros to form the
//! header nonce. Closing frames carry random filler so they always have a
//! full nonce. Output length always equals input length.

mod fingerprint;

pub use fingerprint::{ext, BrowserProfile, FingerprintError};

use crate::crypto::{derive_frame_keys, CryptoError, Keystream, Uid, NONCE_LEN};
use crate::tunnel::{Frame, TunnelError, FRAME_HEADER_SIZE};

/// Traffic direction; each has its own keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    Up,
    /// Server to client
    Down,
}

impl Direction {
    fn label(self) -> &'static [u8] {
        match self {
            Direction::Up => b"cloak/up",
            Direction::Down => b"cloak/down",
        }
    }
}

struct FrameCipher {
    payload: Keystream,
    header: Keystream,
}

impl FrameCipher {
    fn new(uid: &Uid, session_id: u32, direction: Direction) -> Result<Self, CryptoError> {
        let keys = derive_frame_keys(uid.as_bytes(), session_id, direction.label())?;
        Ok(Self {
            payload: Keystream::new(&keys.payload)?,
            header: Keystream::new(&keys.header)?,
        })
    }
}

fn header_nonce(payload: &[u8]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    let tail = &payload[payload.len().saturating_sub(NONCE_LEN)..];
    nonce[NONCE_LEN - tail.len()..].copy_from_slice(tail);
    nonce
}

/// Encodes outbound frames into record bodies
pub struct Obfuscator {
    cipher: FrameCipher,
}

impl Obfuscator {
    pub fn new(uid: &Uid, session_id: u32, direction: Direction) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: FrameCipher::new(uid, session_id, direction)?,
        })
    }

    /// Obfuscate a frame into `header' | payload'`
    pub fn obfuscate(&self, frame: &Frame) -> Result<Vec<u8>, TunnelError> {
        let header = frame.header();
        let mut out = Vec::with_capacity(frame.encoded_size());
        out.extend_from_slice(&header);
        out.extend_from_slice(&frame.payload);

        self.cipher
            .payload
            .apply(header, &mut out[FRAME_HEADER_SIZE..])?;
        let nonce = header_nonce(&out[FRAME_HEADER_SIZE..]);
        self.cipher.header.apply(nonce, &mut out[..FRAME_HEADER_SIZE])?;

        Ok(out)
    }
}

/// Decodes inbound record bodies into frames
pub struct Deobfuscator {
    cipher: FrameCipher,
}

impl Deobfuscator {
    pub fn new(uid: &Uid, session_id: u32, direction: Direction) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: FrameCipher::new(uid, session_id, direction)?,
        })
    }

    /// Reverse `Obfuscator::obfuscate`
    pub fn deobfuscate(&self, record: &[u8]) -> Result<Frame, TunnelError> {
        if record.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "record body too short: {} bytes",
                record.len()
            )));
        }

        let mut buf = record.to_vec();
        let nonce = header_nonce(&buf[FRAME_HEADER_SIZE..]);
        self.cipher.header.apply(nonce, &mut buf[..FRAME_HEADER_SIZE])?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        self.cipher
            .payload
            .apply(header, &mut buf[FRAME_HEADER_SIZE..])?;

        Frame::decode(&buf)
    }
}
