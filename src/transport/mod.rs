//! Transport layer
//!
//! The tunnel never opens sockets itself; it asks a `Dialer` for a duplex
//! byte connection. `TcpDialer` is the stock implementation and tests
//! substitute their own.

mod tcp;

pub use tcp::{SocketProtector, TcpDialer};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// A duplex byte connection to the remote
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned connection as handed out by a dialer
pub type BoxedConn = Box<dyn Connection>;

/// Opens connections to the remote
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`, IPv6 hosts bracketed)
    async fn dial(&self, addr: &str) -> Result<BoxedConn, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle on dialed sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
