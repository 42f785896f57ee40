//! Wire protocol: TLS record framing and the camouflage handshake
//!
//! Every byte on a pooled connection is inside a TLS record. The bootstrap
//! is a TLS 1.2 ClientHello carrying a covert session ticket; afterwards
//! each record body is one obfuscated tunnel frame.

mod handshake;
mod record;
mod ticket;

pub use handshake::{compose_init_handshake, compose_reply, HandshakeParams, REPLY_FINISHED_LEN};
pub use record::{
    application_data, encode_record, read_record, record_header, ContentType, Record,
};
pub use ticket::{open_ticket, seal_ticket, SealedTicket, TicketContents, TICKET_LEN};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),

    #[error("Unexpected record type: {0}")]
    UnexpectedRecord(u8),

    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// TLS 1.2 protocol version
pub const TLS12_VERSION: u16 = 0x0303;

/// Record version used on the initial ClientHello, as browsers do
pub const TLS10_VERSION: u16 = 0x0301;

/// Size of a TLS record header
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record body accepted from the peer (TLS ciphertext bound)
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

/// Records the server sends before the client reply
/// (ServerHello, ChangeCipherSpec, Finished)
pub const SERVER_HANDSHAKE_RECORDS: usize = 3;

/// Default per-record read timeout during the handshake, in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 10;
