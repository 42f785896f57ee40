//! Session: many streams over a pool of physical connections
//!
//! Each pooled connection gets a reader task that deobfuscates records and
//! routes frames to streams. Writes go round-robin across live connections,
//! one whole record at a time under that connection's write lock. Streams
//! reorder by sequence number, so frames of one stream may take different
//! connections.
//!
//! A session is broken once every connection is gone, on a protocol
//! violation, or when closed. Broken is terminal.

use super::{Frame, Stream, TunnelError, Valve, MAX_STREAMS};
use crate::crypto::{CryptoError, Uid};
use crate::obfuscation::{Deobfuscator, Direction, Obfuscator};
use crate::protocol::{application_data, read_record, ContentType, MAX_RECORD_LEN};
use crate::transport::BoxedConn;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Which end of the tunnel this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream ids
    Client,
    /// Opens even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn peer_first_stream_id(self) -> u32 {
        match self {
            Role::Client => 2,
            Role::Server => 1,
        }
    }

    fn owns(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id % 2 == 0,
        }
    }

    fn directions(self) -> (Direction, Direction) {
        match self {
            Role::Client => (Direction::Up, Direction::Down),
            Role::Server => (Direction::Down, Direction::Up),
        }
    }
}

struct PooledConn {
    index: usize,
    alive: AtomicBool,
    writer: tokio::sync::Mutex<WriteHalf<BoxedConn>>,
}

struct StreamTable {
    streams: HashMap<u32, Arc<Stream>>,
    next_local: u32,
    /// Every peer stream id below this has been opened and closed
    peer_floor: u32,
    /// Closed peer stream ids at or above `peer_floor`
    peer_closed: HashSet<u32>,
}

impl StreamTable {
    fn new(role: Role) -> Self {
        Self {
            streams: HashMap::new(),
            next_local: role.first_stream_id(),
            peer_floor: role.peer_first_stream_id(),
            peer_closed: HashSet::new(),
        }
    }

    fn retire_peer(&mut self, stream_id: u32) {
        self.peer_closed.insert(stream_id);
        while self.peer_closed.remove(&self.peer_floor) {
            self.peer_floor = self.peer_floor.saturating_add(2);
        }
    }

    fn is_retired_peer(&self, stream_id: u32) -> bool {
        stream_id < self.peer_floor || self.peer_closed.contains(&stream_id)
    }
}

/// Resolves once the session is broken (or gone)
async fn wait_broken(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A multiplexed session
pub struct Session {
    id: u32,
    role: Role,
    me: Weak<Session>,
    obfs: Obfuscator,
    deobfs: Deobfuscator,
    valve: Arc<Valve>,
    conns: Mutex<Vec<Arc<PooledConn>>>,
    live_conns: AtomicUsize,
    next_conn: AtomicUsize,
    table: Mutex<StreamTable>,
    accept_tx: mpsc::UnboundedSender<Arc<Stream>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Stream>>>,
    broken: watch::Sender<bool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a session with no connections yet
    pub fn new(
        id: u32,
        role: Role,
        valve: Arc<Valve>,
        obfs: Obfuscator,
        deobfs: Deobfuscator,
    ) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (broken, _) = watch::channel(false);

        Arc::new_cyclic(|me| Self {
            id,
            role,
            me: me.clone(),
            obfs,
            deobfs,
            valve,
            conns: Mutex::new(Vec::new()),
            live_conns: AtomicUsize::new(0),
            next_conn: AtomicUsize::new(0),
            table: Mutex::new(StreamTable::new(role)),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            broken,
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Create a session keyed by `uid`, picking obfuscation directions
    /// from the role
    pub fn with_identity(
        uid: &Uid,
        id: u32,
        role: Role,
        valve: Arc<Valve>,
    ) -> Result<Arc<Self>, CryptoError> {
        let (send, recv) = role.directions();
        Ok(Self::new(
            id,
            role,
            valve,
            Obfuscator::new(uid, id, send)?,
            Deobfuscator::new(uid, id, recv)?,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn valve(&self) -> &Arc<Valve> {
        &self.valve
    }

    /// Number of live pooled connections
    pub fn connection_count(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    /// Number of open streams
    pub fn stream_count(&self) -> usize {
        self.table.lock().streams.len()
    }

    /// Whether the session is unusable and must be replaced
    pub fn is_broken(&self) -> bool {
        *self.broken.borrow()
    }

    /// Attach a connection that has completed the handshake
    pub fn add_connection(&self, conn: BoxedConn) -> Result<(), TunnelError> {
        if self.is_broken() {
            return Err(TunnelError::SessionBroken);
        }

        let (reader, writer) = tokio::io::split(conn);
        let pooled = {
            let mut conns = self.conns.lock();
            let pooled = Arc::new(PooledConn {
                index: conns.len(),
                alive: AtomicBool::new(true),
                writer: tokio::sync::Mutex::new(writer),
            });
            conns.push(pooled.clone());
            pooled
        };
        self.live_conns.fetch_add(1, Ordering::AcqRel);

        let handle = tokio::spawn(read_loop(
            self.me.clone(),
            pooled.clone(),
            reader,
            self.broken.subscribe(),
        ));
        self.readers.lock().push(handle);

        debug!("Session {} attached connection {}", self.id, pooled.index);
        Ok(())
    }

    /// Open a new outbound stream
    pub fn open_stream(&self) -> Result<Arc<Stream>, TunnelError> {
        let mut table = self.table.lock();
        if self.is_broken() {
            return Err(TunnelError::SessionUnavailable);
        }
        if table.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::StreamUnavailable);
        }

        let id = table.next_local;
        table.next_local = id.checked_add(2).ok_or(TunnelError::StreamUnavailable)?;

        let stream = Stream::new(id, self.me.clone());
        table.streams.insert(id, stream.clone());
        debug!("Session {} opened stream {}", self.id, id);
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, TunnelError> {
        let mut broken = self.broken.subscribe();
        let mut rx = tokio::select! {
            rx = self.accept_rx.lock() => rx,
            _ = wait_broken(&mut broken) => return Err(TunnelError::SessionUnavailable),
        };
        tokio::select! {
            stream = rx.recv() => stream.ok_or(TunnelError::SessionUnavailable),
            _ = wait_broken(&mut broken) => Err(TunnelError::SessionUnavailable),
        }
    }

    /// Close the session and every stream in it
    pub fn close(&self) {
        if self.set_broken() {
            info!("Session {} closed", self.id);
        }
    }

    pub(super) fn remove_stream(&self, stream_id: u32) {
        let mut table = self.table.lock();
        if table.streams.remove(&stream_id).is_some() && !self.role.owns(stream_id) {
            table.retire_peer(stream_id);
        }
    }

    /// Obfuscate and write one frame to some live connection
    pub(super) async fn send_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        let record = application_data(&self.obfs.obfuscate(&frame)?);
        let mut broken = self.broken.subscribe();

        loop {
            if self.is_broken() {
                return Err(TunnelError::SessionBroken);
            }
            let conn = self.pick_connection().ok_or(TunnelError::SessionBroken)?;

            let result = {
                let mut writer = tokio::select! {
                    writer = conn.writer.lock() => writer,
                    _ = wait_broken(&mut broken) => return Err(TunnelError::SessionBroken),
                };
                tokio::select! {
                    result = writer.write_all(&record) => result,
                    _ = wait_broken(&mut broken) => return Err(TunnelError::SessionBroken),
                }
            };

            match result {
                Ok(()) => {
                    trace!(
                        "Stream {} seq {} -> connection {} ({} bytes)",
                        frame.stream_id,
                        frame.seq,
                        conn.index,
                        record.len()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Write on connection {} failed: {}", conn.index, e);
                    self.connection_lost(&conn);
                }
            }
        }
    }

    fn pick_connection(&self) -> Option<Arc<PooledConn>> {
        let conns = self.conns.lock();
        let n = conns.len();
        if n == 0 {
            return None;
        }
        let start = self.next_conn.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &conns[(start + i) % n])
            .find(|conn| conn.alive.load(Ordering::Acquire))
            .cloned()
    }

    /// Route one inbound record body
    async fn handle_record(&self, body: &[u8]) -> Result<(), TunnelError> {
        let frame = self.deobfs.deobfuscate(body)?;
        let stream_id = frame.stream_id;
        let Some(stream) = self.route(stream_id)? else {
            return Ok(());
        };

        if !frame.closing {
            self.valve.wait_down(frame.payload.len()).await?;
        }
        if stream.deliver(frame)? {
            self.remove_stream(stream_id);
            debug!("Stream {} closed by peer", stream_id);
        }
        Ok(())
    }

    /// Find the stream for an inbound frame, registering peer-opened ones
    fn route(&self, stream_id: u32) -> Result<Option<Arc<Stream>>, TunnelError> {
        if stream_id == 0 {
            return Err(TunnelError::InvalidFrame("stream id 0".into()));
        }

        let mut table = self.table.lock();
        if let Some(stream) = table.streams.get(&stream_id) {
            return Ok(Some(stream.clone()));
        }
        if self.role.owns(stream_id) || table.is_retired_peer(stream_id) {
            trace!("Dropping frame for closed stream {}", stream_id);
            return Ok(None);
        }
        if table.streams.len() >= MAX_STREAMS {
            warn!("Session {} stream table full, refusing {}", self.id, stream_id);
            return Ok(None);
        }

        let stream = Stream::new(stream_id, self.me.clone());
        table.streams.insert(stream_id, stream.clone());
        drop(table);

        debug!("Peer opened stream {}", stream_id);
        let _ = self.accept_tx.send(stream.clone());
        Ok(Some(stream))
    }

    fn connection_lost(&self, conn: &PooledConn) {
        if !conn.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let left = self.live_conns.fetch_sub(1, Ordering::AcqRel) - 1;
        warn!(
            "Session {} lost connection {} ({} left)",
            self.id, conn.index, left
        );
        if left == 0 {
            self.mark_broken("all connections lost");
        }
    }

    fn mark_broken(&self, reason: &str) {
        if self.set_broken() {
            warn!("Session {} broken: {}", self.id, reason);
        }
    }

    /// Tear everything down; returns false if already broken
    fn set_broken(&self) -> bool {
        if self.broken.send_replace(true) {
            return false;
        }
        self.valve.close();

        let streams: Vec<Arc<Stream>> = self
            .table
            .lock()
            .streams
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in streams {
            stream.on_session_broken();
        }

        let conns = std::mem::take(&mut *self.conns.lock());
        self.live_conns.store(0, Ordering::Release);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            for conn in conns {
                conn.alive.store(false, Ordering::Release);
                handle.spawn(async move {
                    let mut writer = conn.writer.lock().await;
                    writer.shutdown().await.ok();
                });
            }
        }
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.readers.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("connections", &self.connection_count())
            .field("broken", &self.is_broken())
            .finish()
    }
}

async fn read_loop(
    session: Weak<Session>,
    conn: Arc<PooledConn>,
    mut reader: ReadHalf<BoxedConn>,
    mut broken: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            result = read_record(&mut reader, MAX_RECORD_LEN) => result,
            _ = wait_broken(&mut broken) => return,
        };
        let Some(session) = session.upgrade() else {
            return;
        };

        match result {
            Ok(record) if record.content_type == ContentType::ApplicationData => {
                match session.handle_record(&record.body).await {
                    Ok(()) => {}
                    Err(TunnelError::SessionBroken) => return,
                    Err(e) => {
                        session.mark_broken(&format!("protocol violation: {}", e));
                        return;
                    }
                }
            }
            Ok(record) => {
                debug!(
                    "Connection {} got {:?} record, dropping it",
                    conn.index, record.content_type
                );
                session.connection_lost(&conn);
                return;
            }
            Err(e) => {
                debug!("Connection {} read ended: {}", conn.index, e);
                session.connection_lost(&conn);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{UNLIMITED_CREDIT, UNLIMITED_RATE};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn uid() -> Uid {
        Uid::from_bytes(&[0x42; 16]).unwrap()
    }

    fn pair(num_conn: usize) -> (Arc<Session>, Arc<Session>) {
        let client = Session::with_identity(&uid(), 99, Role::Client, Arc::new(Valve::unlimited())).unwrap();
        let server = Session::with_identity(&uid(), 99, Role::Server, Arc::new(Valve::unlimited())).unwrap();
        for _ in 0..num_conn {
            let (a, b) = tokio::io::duplex(64 * 1024);
            client.add_connection(Box::new(a)).unwrap();
            server.add_connection(Box::new(b)).unwrap();
        }
        (client, server)
    }

    async fn read_exact(stream: &Stream, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 4096];
        while out.len() < len {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_stream_ids_by_role() {
        let (client, server) = pair(1);
        assert_eq!(client.open_stream().unwrap().id(), 1);
        assert_eq!(client.open_stream().unwrap().id(), 3);
        assert_eq!(server.open_stream().unwrap().id(), 2);
        assert_eq!(server.open_stream().unwrap().id(), 4);
    }

    #[tokio::test]
    async fn test_ordered_delivery_across_pool() {
        let (client, server) = pair(3);
        let stream = client.open_stream().unwrap();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        stream.write(&data[..40_000]).await.unwrap();
        stream.write(&data[40_000..]).await.unwrap();

        let peer = server.accept_stream().await.unwrap();
        assert_eq!(peer.id(), stream.id());
        assert_eq!(read_exact(&peer, data.len()).await, data);

        peer.write(b"pong").await.unwrap();
        assert_eq!(read_exact(&stream, 4).await, b"pong");
    }

    #[tokio::test]
    async fn test_peer_close_delivers_then_ends() {
        let (client, server) = pair(2);
        let stream = client.open_stream().unwrap();
        stream.write(b"last words").await.unwrap();
        stream.close().await;
        assert_eq!(client.stream_count(), 0);

        let peer = server.accept_stream().await.unwrap();
        assert_eq!(read_exact(&peer, 10).await, b"last words");

        let mut buf = [0u8; 8];
        assert!(matches!(
            peer.read(&mut buf).await,
            Err(TunnelError::StreamClosed)
        ));
        assert!(!server.is_broken());
    }

    #[tokio::test]
    async fn test_losing_all_connections_breaks_session() {
        let client = Session::with_identity(&uid(), 7, Role::Client, Arc::new(Valve::unlimited())).unwrap();
        let (a, b) = tokio::io::duplex(1024);
        client.add_connection(Box::new(a)).unwrap();

        let stream = client.open_stream().unwrap();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                stream.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(b);

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::SessionBroken)));
        assert!(client.is_broken());
        assert!(matches!(
            client.open_stream(),
            Err(TunnelError::SessionUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_garbage_record_is_protocol_violation() {
        let client = Session::with_identity(&uid(), 7, Role::Client, Arc::new(Valve::unlimited())).unwrap();
        let (a, mut b) = tokio::io::duplex(1024);
        client.add_connection(Box::new(a)).unwrap();

        // decodes to a header whose closing flag is not 0 or 1
        let mut junk = vec![0u8; 64];
        crate::crypto::random_bytes(&mut junk);
        b.write_all(&application_data(&junk)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !client.is_broken() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_broken());
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (client, server) = pair(1);
        let accept = {
            let server = server.clone();
            tokio::spawn(async move { server.accept_stream().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();
        let result = tokio::time::timeout(Duration::from_secs(1), accept)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::SessionUnavailable)));

        client.close();
        let stream_err = client.open_stream();
        assert!(stream_err.is_err());
    }

    #[tokio::test]
    async fn test_write_after_session_close_fails() {
        let (client, _server) = pair(1);
        let stream = client.open_stream().unwrap();
        client.close();
        assert!(matches!(
            stream.write(b"data").await,
            Err(TunnelError::SessionBroken)
        ));

        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_sees_raw_records() {
        let client = Session::with_identity(&uid(), 11, Role::Client, Arc::new(Valve::unlimited())).unwrap();
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        client.add_connection(Box::new(a)).unwrap();

        let stream = client.open_stream().unwrap();
        stream.write(b"PING").await.unwrap();

        let mut header = [0u8; 5];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..3], &[0x17, 0x03, 0x03]);
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        assert_eq!(len, 12 + 4);

        let mut body = vec![0u8; len];
        b.read_exact(&mut body).await.unwrap();
        let deobfs = Deobfuscator::new(&uid(), 11, Direction::Up).unwrap();
        let frame = deobfs.deobfuscate(&body).unwrap();
        assert_eq!(frame.stream_id, 1);
        assert_eq!(&frame.payload[..], b"PING");
    }

    /// Writes an obfuscated server-to-client frame straight onto the wire
    async fn send_down(wire: &mut tokio::io::DuplexStream, session_id: u32, frame: &Frame) {
        let obfs = Obfuscator::new(&uid(), session_id, Direction::Down).unwrap();
        let record = application_data(&obfs.obfuscate(frame).unwrap());
        wire.write_all(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_streams_may_arrive_out_of_order() {
        let (client, server) = pair(1);
        let first = client.open_stream().unwrap();
        let second = client.open_stream().unwrap();

        second.write(b"three").await.unwrap();
        first.write(b"one").await.unwrap();

        let mut accepted = HashMap::new();
        for _ in 0..2 {
            let peer = tokio::time::timeout(Duration::from_secs(2), server.accept_stream())
                .await
                .unwrap()
                .unwrap();
            accepted.insert(peer.id(), peer);
        }
        assert_eq!(read_exact(&accepted[&3], 5).await, b"three");
        assert_eq!(read_exact(&accepted[&1], 3).await, b"one");
    }

    #[tokio::test]
    async fn test_closed_peer_stream_is_not_reopened() {
        let server =
            Session::with_identity(&uid(), 5, Role::Server, Arc::new(Valve::unlimited())).unwrap();

        assert_eq!(server.route(3).unwrap().unwrap().id(), 3);
        assert_eq!(server.route(1).unwrap().unwrap().id(), 1);

        server.remove_stream(1);
        assert!(server.route(1).unwrap().is_none());
        assert_eq!(server.route(3).unwrap().unwrap().id(), 3);

        server.remove_stream(3);
        assert!(server.route(3).unwrap().is_none());
        assert_eq!(server.table.lock().peer_floor, 5);
        assert!(server.table.lock().peer_closed.is_empty());

        assert_eq!(server.route(5).unwrap().unwrap().id(), 5);
        // even ids belong to the server itself
        assert!(server.route(2).unwrap().is_none());

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(server.accept_stream().await.unwrap().id());
        }
        assert_eq!(order, vec![3, 1, 5]);
    }

    #[tokio::test]
    async fn test_dropped_frames_use_no_download_credit() {
        let valve = Arc::new(Valve::new(UNLIMITED_RATE, UNLIMITED_RATE, UNLIMITED_CREDIT, 8));
        let client = Session::with_identity(&uid(), 21, Role::Client, valve.clone()).unwrap();
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        client.add_connection(Box::new(a)).unwrap();

        // stream 1 was never opened locally, so this is dropped unmetered
        send_down(&mut b, 21, &Frame::data(1, 0, Bytes::from(vec![9u8; 64]))).await;
        send_down(&mut b, 21, &Frame::data(2, 0, Bytes::from_static(b"okay"))).await;

        let peer = tokio::time::timeout(Duration::from_secs(2), client.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.id(), 2);
        assert_eq!(read_exact(&peer, 4).await, b"okay");
        assert_eq!(valve.down_used(), 4);
        assert!(!client.is_broken());
    }

    #[tokio::test]
    async fn test_sequence_gap_beyond_window_breaks_session() {
        let client = Session::with_identity(&uid(), 23, Role::Client, Arc::new(Valve::unlimited())).unwrap();
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        client.add_connection(Box::new(a)).unwrap();

        let far = crate::tunnel::REORDER_WINDOW + 5;
        send_down(&mut b, 23, &Frame::data(2, far, Bytes::from_static(b"x"))).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !client.is_broken() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_broken());
    }

    #[tokio::test]
    async fn test_close_unblocks_write_waiting_for_credit() {
        let valve = Arc::new(Valve::new(UNLIMITED_RATE, UNLIMITED_RATE, 10, UNLIMITED_CREDIT));
        let client = Session::with_identity(&uid(), 25, Role::Client, valve.clone()).unwrap();
        let (a, _b) = tokio::io::duplex(64 * 1024);
        client.add_connection(Box::new(a)).unwrap();

        let stream = client.open_stream().unwrap();
        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&[1u8; 20]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        stream.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::StreamClosed)));
        assert_eq!(valve.up_used(), 0);
        assert!(!client.is_broken());
    }
}
