//! # Cloak Tunnel
//!
//! Client side of a censorship-resistant transport that disguises its
//! bootstrap as a TLS 1.2 handshake and then multiplexes many logical
//! byte streams over a pool of physical TCP connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Local Accept Loop                  │
//! │          (one stream per local connection)           │
//! ├─────────────────────────────────────────────────────┤
//! │                     Pipe Layer                       │
//! │        (bidirectional relay, shared teardown)        │
//! ├─────────────────────────────────────────────────────┤
//! │                    Session Layer                     │
//! │   (stream routing, reassembly, valve, liveness)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Obfuscation Layer                   │
//! │        (identity-keyed frame transform)              │
//! ├─────────────────────────────────────────────────────┤
//! │              Camouflage Handshake Layer              │
//! │  (ClientHello with covert ticket, discarded replies) │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │             (pluggable dialer, raw TCP)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod pipe;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default remote port (looks like HTTPS)
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error is confined to one connection attempt and may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Protocol(protocol::ProtocolError::Crypto(_)) => false,
            Error::Io(_) | Error::Protocol(_) | Error::Transport(_) => true,
            Error::Crypto(_) | Error::Tunnel(_) | Error::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::from(protocol::ProtocolError::Timeout).is_retryable());
        assert!(Error::from(transport::TransportError::DialFailed("refused".into())).is_retryable());
        assert!(Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable());

        assert!(!Error::from(crypto::CryptoError::InvalidKeyLength).is_retryable());
        assert!(!Error::from(protocol::ProtocolError::Crypto(crypto::CryptoError::InvalidKeyLength)).is_retryable());
        assert!(!Error::from(tunnel::TunnelError::SessionUnavailable).is_retryable());
        assert!(!Error::from(config::ConfigError::Missing("uid")).is_retryable());
    }
}
