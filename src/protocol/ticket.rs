//! Covert session ticket
//!
//! Layout (192 bytes, the size of a typical browser session ticket):
//! ```text
//! +-----------------+-----------+------------------------------+---------+
//! | eph_pub (32B)   | nonce(12B)| sealed contents + tag (69B)  | padding |
//! +-----------------+-----------+------------------------------+---------+
//! ```
//!
//! The ephemeral key is derived from the UID and the current time bucket
//! (`unix_time / ticket_time_hint`), so the ticket prefix stays stable for a
//! while and then rotates.

use super::handshake::client_hello_parts;
use super::ProtocolError;
use crate::crypto::{
    derive_ephemeral_seed, derive_ticket_key, random_bytes, ticket_tag, verify_ticket_tag, Cipher,
    EphemeralKey, PublicKey, ServerKeyPair, Uid, KEY_LEN, NONCE_LEN, TAG_LEN, TAG_SALT_LEN,
};
use bytes::{Buf, BufMut, BytesMut};

/// Total ticket length
pub const TICKET_LEN: usize = 192;

const UID_FIELD_LEN: usize = 32;
const CONTENTS_LEN: usize = 1 + UID_FIELD_LEN + 4 + 8 + 8;
const SEALED_LEN: usize = CONTENTS_LEN + TAG_LEN;
const SEALED_OFFSET: usize = KEY_LEN + NONCE_LEN;

/// What the ticket tells the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketContents {
    pub uid: Uid,
    pub session_id: u32,
    pub ticket_time_hint: u64,
    pub unix_time: u64,
}

/// A sealed ticket plus the tag that goes in the ClientHello random
pub struct SealedTicket {
    pub ticket: Vec<u8>,
    pub tag: [u8; 32],
}

impl TicketContents {
    fn encode(&self) -> Vec<u8> {
        let uid = self.uid.as_bytes();
        let mut buf = BytesMut::with_capacity(CONTENTS_LEN);
        buf.put_u8(uid.len() as u8);
        buf.put_slice(uid);
        buf.put_bytes(0, UID_FIELD_LEN - uid.len());
        buf.put_u32(self.session_id);
        buf.put_u64(self.ticket_time_hint);
        buf.put_u64(self.unix_time);
        buf.to_vec()
    }

    fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != CONTENTS_LEN {
            return Err(ProtocolError::InvalidTicket("bad contents length".into()));
        }
        let uid_len = buf.get_u8() as usize;
        if uid_len > UID_FIELD_LEN {
            return Err(ProtocolError::InvalidTicket("bad uid length".into()));
        }
        let uid = Uid::from_bytes(&buf[..uid_len])?;
        buf.advance(UID_FIELD_LEN);

        Ok(Self {
            uid,
            session_id: buf.get_u32(),
            ticket_time_hint: buf.get_u64(),
            unix_time: buf.get_u64(),
        })
    }
}

/// Seal the ticket for `contents` to the server's public key
pub fn seal_ticket(
    contents: &TicketContents,
    server_public: &PublicKey,
) -> Result<SealedTicket, ProtocolError> {
    let bucket = contents.unix_time / contents.ticket_time_hint.max(1);
    let ephemeral = EphemeralKey::from_seed(derive_ephemeral_seed(
        contents.uid.as_bytes(),
        bucket,
    )?);
    let key = derive_ticket_key(&ephemeral.agree(server_public))?;
    let mut salt = [0u8; TAG_SALT_LEN];
    random_bytes(&mut salt);
    let tag = ticket_tag(&key, ephemeral.public().as_bytes(), &salt);

    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce);
    let sealed = Cipher::new(&key)?.seal(nonce, ephemeral.public().as_bytes(), &contents.encode())?;

    let mut ticket = Vec::with_capacity(TICKET_LEN);
    ticket.extend_from_slice(ephemeral.public().as_bytes());
    ticket.extend_from_slice(&nonce);
    ticket.extend_from_slice(&sealed);
    let mut padding = vec![0u8; TICKET_LEN - ticket.len()];
    random_bytes(&mut padding);
    ticket.extend_from_slice(&padding);

    Ok(SealedTicket { ticket, tag })
}

/// Recover the ticket contents from a ClientHello record.
///
/// Fails unless the hello's random field is the tag for the embedded
/// ephemeral key, i.e. unless it was built for this server.
pub fn open_ticket(
    server: &ServerKeyPair,
    client_hello: &[u8],
) -> Result<TicketContents, ProtocolError> {
    let (random, ticket) = client_hello_parts(client_hello)?;
    if ticket.len() != TICKET_LEN {
        return Err(ProtocolError::InvalidTicket(format!(
            "ticket is {} bytes",
            ticket.len()
        )));
    }

    let eph_pub = PublicKey::from_bytes(&ticket[..KEY_LEN])?;
    let key = derive_ticket_key(&server.agree(&eph_pub))?;
    if !verify_ticket_tag(&key, eph_pub.as_bytes(), &random) {
        return Err(ProtocolError::InvalidTicket("tag mismatch".into()));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&ticket[KEY_LEN..SEALED_OFFSET]);
    let contents = Cipher::new(&key)?.open(
        nonce,
        eph_pub.as_bytes(),
        &ticket[SEALED_OFFSET..SEALED_OFFSET + SEALED_LEN],
    )?;
    TicketContents::decode(&contents)
}
