//! Key Derivation Functions
//!
//! HKDF-SHA256 over the client UID for frame keys, and over the ECDH output
//! for the covert ticket.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use ring::hmac;

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key material bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Keys for one direction of frame obfuscation
#[derive(Clone)]
pub struct FrameKeys {
    /// Keystream key for frame payloads
    pub payload: [u8; KEY_LEN],
    /// Keystream key for frame headers
    pub header: [u8; KEY_LEN],
}

/// Derive the frame keys for one direction of one session.
///
/// `direction` must differ between client→server and server→client so the
/// two directions never share a keystream.
pub fn derive_frame_keys(
    uid: &[u8],
    session_id: u32,
    direction: &[u8],
) -> Result<FrameKeys, CryptoError> {
    let hkdf = Hkdf::new(Some(&session_id.to_be_bytes()), uid);

    let mut info = Vec::with_capacity(direction.len() + 8);
    info.extend_from_slice(direction);
    info.extend_from_slice(b"/payload");
    let payload = hkdf.expand_key(&info)?;

    info.truncate(direction.len());
    info.extend_from_slice(b"/header");
    let header = hkdf.expand_key(&info)?;

    Ok(FrameKeys { payload, header })
}

/// Seed for the ephemeral ticket key of one time bucket.
///
/// The same UID within the same bucket yields the same ephemeral key, so the
/// session ticket stays stable for `ticket_time_hint` seconds like a browser's.
pub fn derive_ephemeral_seed(uid: &[u8], time_bucket: u64) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(Some(&time_bucket.to_be_bytes()), uid).expand_key(b"cloak_ticket_ephemeral")
}

/// Sealing key for the covert ticket, from the X25519 shared secret
pub fn derive_ticket_key(shared_secret: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(None, shared_secret).expand_key(b"cloak_ticket_key")
}

/// Fresh bytes at the front of every ClientHello random
pub const TAG_SALT_LEN: usize = 16;

/// Tag placed in the ClientHello random field: `salt ‖ HMAC(key, eph_pub ‖ salt)`
/// truncated to 32 bytes.
///
/// Lets the server recognise the hello cheaply while looking random to
/// anyone without the shared secret. The salt is drawn per handshake, so no
/// two hellos share a random even within one ticket bucket.
pub fn ticket_tag(
    ticket_key: &[u8; KEY_LEN],
    ephemeral_public: &[u8],
    salt: &[u8; TAG_SALT_LEN],
) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, ticket_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(ephemeral_public);
    ctx.update(salt);
    let mac = ctx.sign();

    let mut out = [0u8; 32];
    out[..TAG_SALT_LEN].copy_from_slice(salt);
    out[TAG_SALT_LEN..].copy_from_slice(&mac.as_ref()[..32 - TAG_SALT_LEN]);
    out
}

/// Check a ClientHello random against the ticket key
pub fn verify_ticket_tag(ticket_key: &[u8; KEY_LEN], ephemeral_public: &[u8], random: &[u8; 32]) -> bool {
    let mut salt = [0u8; TAG_SALT_LEN];
    salt.copy_from_slice(&random[..TAG_SALT_LEN]);
    ticket_tag(ticket_key, ephemeral_public, &salt) == *random
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels_differ() {
        let hkdf = Hkdf::new(Some(b"salt"), b"input keying material");

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();
        assert_ne!(key1, key2);
        assert_eq!(key1, hkdf.expand_key(b"label1").unwrap());
    }

    #[test]
    fn test_frame_keys_depend_on_direction_and_session() {
        let uid = [7u8; 16];
        let up = derive_frame_keys(&uid, 1, b"up").unwrap();
        let down = derive_frame_keys(&uid, 1, b"down").unwrap();
        let other_session = derive_frame_keys(&uid, 2, b"up").unwrap();

        assert_ne!(up.payload, down.payload);
        assert_ne!(up.payload, up.header);
        assert_ne!(up.payload, other_session.payload);
    }

    #[test]
    fn test_ticket_tag_carries_salt() {
        let key = [3u8; KEY_LEN];
        let tag_a = ticket_tag(&key, b"ephemeral", &[1u8; TAG_SALT_LEN]);
        let tag_b = ticket_tag(&key, b"ephemeral", &[2u8; TAG_SALT_LEN]);

        assert_eq!(&tag_a[..TAG_SALT_LEN], &[1u8; TAG_SALT_LEN]);
        assert_ne!(tag_a[TAG_SALT_LEN..], tag_b[TAG_SALT_LEN..]);
        assert!(verify_ticket_tag(&key, b"ephemeral", &tag_a));
        assert!(!verify_ticket_tag(&[4u8; KEY_LEN], b"ephemeral", &tag_a));

        let mut forged = tag_a;
        forged[0] ^= 1;
        assert!(!verify_ticket_tag(&key, b"ephemeral", &forged));
    }

    #[test]
    fn test_ephemeral_seed_is_stable_within_bucket() {
        let uid = [1u8; 16];
        assert_eq!(
            derive_ephemeral_seed(&uid, 10).unwrap(),
            derive_ephemeral_seed(&uid, 10).unwrap()
        );
        assert_ne!(
            derive_ephemeral_seed(&uid, 10).unwrap(),
            derive_ephemeral_seed(&uid, 11).unwrap()
        );
    }
}
