//! Multiplexed stream implementation

use super::{Frame, Session, TunnelError, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Frames a stream may buffer ahead of the next expected sequence number
pub const REORDER_WINDOW: u32 = 1024;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Peer sent its closing frame; buffered data may remain
    ClosedRemote,
    /// Closed locally
    Closed,
}

/// Receive side: reorder buffer and ready data
struct RecvState {
    next_seq: u32,
    pending: BTreeMap<u32, Frame>,
    ready: VecDeque<Bytes>,
    peer_closed: bool,
    session_broken: bool,
}

impl RecvState {
    /// Slot a frame in; returns true if the peer's closing frame was reached.
    /// A frame further ahead than the reorder window is a protocol violation.
    fn push(&mut self, frame: Frame) -> Result<bool, TunnelError> {
        if frame.seq < self.next_seq || self.peer_closed {
            trace!("Dropping stale frame seq {}", frame.seq);
            return Ok(false);
        }
        if frame.seq - self.next_seq >= REORDER_WINDOW {
            return Err(TunnelError::InvalidFrame(format!(
                "stream {} seq {} is beyond the reorder window (expecting {})",
                frame.stream_id, frame.seq, self.next_seq
            )));
        }
        self.pending.insert(frame.seq, frame);

        while let Some(frame) = self.pending.remove(&self.next_seq) {
            self.next_seq = self.next_seq.wrapping_add(1);
            if frame.closing {
                self.peer_closed = true;
                self.pending.clear();
                return Ok(true);
            }
            if !frame.payload.is_empty() {
                self.ready.push_back(frame.payload);
            }
        }
        Ok(false)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;

        while total < buf.len() {
            let Some(data) = self.ready.front_mut() else {
                break;
            };
            let to_copy = std::cmp::min(data.len(), buf.len() - total);
            buf[total..total + to_copy].copy_from_slice(&data[..to_copy]);
            total += to_copy;

            if to_copy == data.len() {
                self.ready.pop_front();
            } else {
                *data = data.slice(to_copy..);
            }
        }

        total
    }
}

/// A logical byte stream within a session
pub struct Stream {
    id: u32,
    session: Weak<Session>,
    write_seq: AtomicU32,
    recv: Mutex<RecvState>,
    readable: Notify,
    closed: AtomicBool,
    /// Wakes writers stalled on credit or rate when the stream closes
    close_signal: Notify,
}

impl Stream {
    pub(super) fn new(id: u32, session: Weak<Session>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            write_seq: AtomicU32::new(0),
            recv: Mutex::new(RecvState {
                next_seq: 0,
                pending: BTreeMap::new(),
                ready: VecDeque::new(),
                peer_closed: false,
                session_broken: false,
            }),
            readable: Notify::new(),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        if self.closed.load(Ordering::Acquire) {
            StreamState::Closed
        } else if self.recv.lock().peer_closed {
            StreamState::ClosedRemote
        } else {
            StreamState::Open
        }
    }

    fn session(&self) -> Result<Arc<Session>, TunnelError> {
        self.session.upgrade().ok_or(TunnelError::SessionBroken)
    }

    /// Read at least one byte.
    ///
    /// Returns as soon as any data is ready. Once the peer has closed, data
    /// already received is still returned before `StreamClosed`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut recv = self.recv.lock();
                let n = recv.read_into(buf);
                if n > 0 {
                    return Ok(n);
                }
                if self.closed.load(Ordering::Acquire) || recv.peer_closed {
                    return Err(TunnelError::StreamClosed);
                }
                if recv.session_broken {
                    return Err(TunnelError::SessionBroken);
                }
            }
            match self.session.upgrade() {
                Some(session) if !session.is_broken() => {}
                _ => return Err(TunnelError::SessionBroken),
            }

            notified.await;
        }
    }

    /// Write all of `data`, split into frames of at most `MAX_PAYLOAD_SIZE`
    pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) || self.recv.lock().peer_closed {
            return Err(TunnelError::StreamClosed);
        }
        let session = self.session()?;

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            if session.is_broken() {
                return Err(TunnelError::SessionBroken);
            }
            // Only the valve wait is abandoned on close: once a sequence
            // number is taken the frame must reach the wire whole.
            tokio::select! {
                result = session.valve().wait_up(chunk.len()) => result?,
                _ = self.wait_closed() => return Err(TunnelError::StreamClosed),
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TunnelError::StreamClosed);
            }
            let seq = self.write_seq.fetch_add(1, Ordering::AcqRel);
            session
                .send_frame(Frame::data(self.id, seq, Bytes::copy_from_slice(chunk)))
                .await?;
        }

        Ok(data.len())
    }

    /// Close the stream. Idempotent; sibling streams and the session are
    /// unaffected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.readable.notify_waiters();
        self.close_signal.notify_waiters();

        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.remove_stream(self.id);

        let peer_closed = self.recv.lock().peer_closed;
        if !peer_closed && !session.is_broken() {
            let seq = self.write_seq.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = session.send_frame(Frame::closing(self.id, seq)).await {
                debug!("Stream {} closing frame not sent: {}", self.id, e);
            }
        }
        debug!("Stream {} closed", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Hand an inbound frame to the reorder buffer; returns true once the
    /// peer's closing frame has been sequenced
    pub(super) fn deliver(&self, frame: Frame) -> Result<bool, TunnelError> {
        let peer_closed = self.recv.lock().push(frame)?;
        self.readable.notify_waiters();
        Ok(peer_closed)
    }

    pub(super) fn on_session_broken(&self) {
        self.recv.lock().session_broken = true;
        self.readable.notify_waiters();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detached(id: u32) -> Arc<Stream> {
        Stream::new(id, Weak::new())
    }

    #[tokio::test]
    async fn test_reorders_by_sequence() {
        let stream = detached(1);
        stream.deliver(Frame::data(1, 1, Bytes::from_static(b"World"))).unwrap();
        stream.deliver(Frame::data(1, 0, Bytes::from_static(b"Hello "))).unwrap();

        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello World");
    }

    #[tokio::test]
    async fn test_read_returns_partial() {
        let stream = detached(1);
        stream.deliver(Frame::data(1, 0, Bytes::from_static(b"abc"))).unwrap();

        let mut buf = [0u8; 1024];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_buffered_data_survives_peer_close() {
        let stream = detached(1);
        stream.deliver(Frame::data(1, 0, Bytes::from_static(b"tail"))).unwrap();
        assert!(stream.deliver(Frame::closing(1, 1)).unwrap());
        assert_eq!(stream.state(), StreamState::ClosedRemote);

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(TunnelError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_closing_frame_waits_for_gap() {
        let stream = detached(1);
        assert!(!stream.deliver(Frame::closing(1, 1)).unwrap());
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.deliver(Frame::data(1, 0, Bytes::from_static(b"x"))).unwrap());
    }

    #[tokio::test]
    async fn test_read_without_session_fails() {
        let stream = detached(1);
        let mut buf = [0u8; 8];
        let result = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(result, Err(TunnelError::SessionBroken)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stream = detached(5);
        stream.close().await;
        stream.close().await;
        assert!(stream.is_closed());

        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(TunnelError::StreamClosed)
        ));
        assert!(matches!(
            stream.write(b"late").await,
            Err(TunnelError::StreamClosed)
        ));
    }

    #[test]
    fn test_stale_frames_dropped() {
        let mut recv = RecvState {
            next_seq: 0,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            peer_closed: false,
            session_broken: false,
        };
        recv.push(Frame::data(1, 0, Bytes::from_static(b"a"))).unwrap();
        assert!(!recv.push(Frame::data(1, 0, Bytes::from_static(b"a"))).unwrap());
        assert_eq!(recv.ready.len(), 1);
    }

    #[tokio::test]
    async fn test_gap_beyond_reorder_window_is_rejected() {
        let stream = detached(1);
        let last_in_window = REORDER_WINDOW - 1;
        stream
            .deliver(Frame::data(1, last_in_window, Bytes::from_static(b"far")))
            .unwrap();
        assert!(matches!(
            stream.deliver(Frame::data(1, REORDER_WINDOW, Bytes::from_static(b"too far"))),
            Err(TunnelError::InvalidFrame(_))
        ));
        assert_eq!(stream.recv.lock().pending.len(), 1);

        // filling the gap drains everything buffered
        for seq in 0..last_in_window {
            stream.deliver(Frame::data(1, seq, Bytes::new())).unwrap();
        }
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"far");
        assert!(stream.recv.lock().pending.is_empty());
    }
}
