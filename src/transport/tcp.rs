//! TCP dialer

use super::{BoxedConn, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Hook run on every socket before it connects.
///
/// Used on platforms where outbound sockets must be exempted from a local
/// VPN (e.g. Android `VpnService.protect`).
pub type SocketProtector = Arc<dyn Fn(&TcpSocket) -> io::Result<()> + Send + Sync>;

/// Dials plain TCP connections
#[derive(Clone)]
pub struct TcpDialer {
    config: TransportConfig,
    protector: Option<SocketProtector>,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            protector: None,
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }

    /// Install a socket protector
    pub fn with_protector(mut self, protector: SocketProtector) -> Self {
        self.protector = Some(protector);
        self
    }

    async fn connect_one(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(protect) = &self.protector {
            protect(&socket)?;
        }

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(stream)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedConn, TransportError> {
        let candidates = lookup_host(addr)
            .await
            .map_err(|e| TransportError::DialFailed(format!("{}: {}", addr, e)))?;

        let mut last_err = None;
        for candidate in candidates {
            match self.connect_one(candidate).await {
                Ok(stream) => {
                    debug!("Connected to {} ({})", addr, candidate);
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(TransportError::DialFailed(match last_err {
            Some(e) => format!("{}: {}", addr, e),
            None => format!("{}: no addresses", addr),
        }))
    }
}
