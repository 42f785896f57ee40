//! Client side: connection pool setup and the local accept loop
//!
//! ```text
//! local accept ──► first chunk ──► open stream ──► bridge(local, stream)
//!                                      │
//!                    session (rebuilt when broken)
//!                                      │
//!            N × [dial ─► ClientHello ─► discard 3 records ─► reply]
//! ```

use crate::config::TunnelSettings;
use crate::crypto;
use crate::pipe::{bridge, LocalConn};
use crate::protocol::{
    compose_init_handshake, compose_reply, read_record, HandshakeParams, ProtocolError,
    MAX_RECORD_LEN, SERVER_HANDSHAKE_RECORDS,
};
use crate::transport::{BoxedConn, Dialer};
use crate::tunnel::{Role, Session, TunnelError, Valve};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Size of the first read from a new local connection
pub const FIRST_CHUNK_SIZE: usize = 10240;

/// How handshake attempts are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts
    pub backoff: Duration,
    /// Attempts per connection before giving up; `None` never gives up
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have failed
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Dial the remote and run the camouflage handshake on the new connection
pub async fn make_remote_conn(
    settings: &TunnelSettings,
    session_id: u32,
    dialer: &dyn Dialer,
) -> Result<BoxedConn> {
    let mut conn = dialer.dial(&settings.remote_addr).await?;

    let hello = compose_init_handshake(&HandshakeParams {
        uid: &settings.uid,
        server_public: &settings.server_public,
        session_id,
        ticket_time_hint: settings.ticket_time_hint,
        server_name: &settings.server_name,
        profile: settings.profile,
        unix_time: unix_time(),
    })?;
    conn.write_all(&hello).await?;

    for i in 0..SERVER_HANDSHAKE_RECORDS {
        match tokio::time::timeout(
            settings.handshake_timeout,
            read_record(&mut conn, MAX_RECORD_LEN),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "server record {}: {}",
                    i + 1,
                    e
                ))
                .into())
            }
            Err(_) => return Err(ProtocolError::Timeout.into()),
        }
    }

    conn.write_all(&compose_reply()).await?;
    conn.flush().await?;
    Ok(conn)
}

async fn connect_with_retry(
    settings: &TunnelSettings,
    session_id: u32,
    dialer: &dyn Dialer,
    index: usize,
) -> Result<BoxedConn> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match make_remote_conn(settings, session_id, dialer).await {
            Ok(conn) => {
                debug!(
                    "Connection {} of session {} ready after {} attempt(s)",
                    index, session_id, attempts
                );
                return Ok(conn);
            }
            Err(e) if !e.is_retryable() => {
                error!("Connection {} failed: {}", index, e);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Connection {} attempt {} failed: {}",
                    index, attempts, e
                );
                if !settings.retry.allows_retry(attempts) {
                    error!(
                        "Connection {} gave up after {} attempts",
                        index, attempts
                    );
                    return Err(TunnelError::SessionUnavailable.into());
                }
                tokio::time::sleep(settings.retry.backoff).await;
            }
        }
    }
}

/// Build a session over `num_conn` handshaken connections.
///
/// Returns only once every connection has completed the handshake; no
/// session exists before that. With a bounded retry policy, exhausting the
/// attempts of any connection fails the whole construction.
pub async fn make_session(
    settings: Arc<TunnelSettings>,
    dialer: Arc<dyn Dialer>,
) -> Result<Arc<Session>> {
    let session_id = crypto::session_id();
    info!(
        "Establishing session {} with {} connection(s) to {}",
        session_id, settings.num_conn, settings.remote_addr
    );

    let mut attempts = JoinSet::new();
    for index in 0..settings.num_conn {
        let settings = settings.clone();
        let dialer = dialer.clone();
        attempts.spawn(async move {
            connect_with_retry(&settings, session_id, dialer.as_ref(), index).await
        });
    }

    let mut conns = Vec::with_capacity(settings.num_conn);
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Ok(conn)) => conns.push(conn),
            Ok(Err(e)) => {
                attempts.abort_all();
                return Err(e);
            }
            Err(e) => {
                error!("Handshake task failed: {}", e);
                attempts.abort_all();
                return Err(TunnelError::SessionUnavailable.into());
            }
        }
    }

    let valve = Arc::new(Valve::new(
        settings.up_rate,
        settings.down_rate,
        settings.up_credit,
        settings.down_credit,
    ));
    let session = Session::with_identity(&settings.uid, session_id, Role::Client, valve)?;
    for conn in conns {
        session.add_connection(conn)?;
    }

    info!("Session {} ready", session_id);
    Ok(session)
}

/// Serve one local connection: wait for its first bytes, then bridge it to
/// a new stream
async fn handle_local(mut socket: TcpStream, session: Arc<Session>) {
    let mut first = vec![0u8; FIRST_CHUNK_SIZE];
    let n = match socket.read(&mut first).await {
        Ok(0) => {
            debug!("Local connection closed before sending data");
            return;
        }
        Ok(n) => n,
        Err(e) => {
            debug!("Local read failed: {}", e);
            return;
        }
    };

    let stream = match session.open_stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open stream: {}", e);
            return;
        }
    };
    if let Err(e) = stream.write(&first[..n]).await {
        warn!("Failed to write first chunk to stream {}: {}", stream.id(), e);
        stream.close().await;
        return;
    }

    debug!("Bridging local connection to stream {}", stream.id());
    bridge(Arc::new(LocalConn::new(socket)), stream);
}

/// Accept local connections forever, (re)building the session as needed
pub async fn serve(
    listener: TcpListener,
    settings: Arc<TunnelSettings>,
    dialer: Arc<dyn Dialer>,
) -> Result<()> {
    let mut session: Option<Arc<Session>> = None;

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        debug!("Accepted local connection from {}", peer);

        let current = match &session {
            Some(s) if !s.is_broken() => s.clone(),
            _ => {
                if session.is_some() {
                    info!("Session broken, rebuilding");
                }
                match make_session(settings.clone(), dialer.clone()).await {
                    Ok(s) => {
                        session = Some(s.clone());
                        s
                    }
                    Err(e) => {
                        error!("Failed to establish session: {}", e);
                        session = None;
                        continue;
                    }
                }
            }
        };

        tokio::spawn(handle_local(socket, current));
    }
}
