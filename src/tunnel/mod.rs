//! Tunnel layer - multiplexed streams over a connection pool
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing and reassembly
//! - Session-wide flow control (valve)
//! - Session liveness tracking

mod frame;
mod session;
mod stream;
mod valve;

pub use frame::{Frame, CLOSING_FILLER_LEN, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use session::{Role, Session};
pub use stream::{Stream, StreamState, REORDER_WINDOW};
pub use valve::{Valve, UNLIMITED_CREDIT, UNLIMITED_RATE};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Session broken")]
    SessionBroken,

    #[error("Session unavailable")]
    SessionUnavailable,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream unavailable")]
    StreamUnavailable,

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Maximum number of concurrent streams per session
pub const MAX_STREAMS: usize = 4096;
