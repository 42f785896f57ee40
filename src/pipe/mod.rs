//! Connection pipe: relay bytes between a local connection and a stream
//!
//! A bridge is two pipes, one per direction, sharing a `Teardown`. Whichever
//! pipe fails first fires it; the other pipe stops at its next suspension
//! point and both endpoints are closed in detached tasks.

use crate::transport::{BoxedConn, Connection};
use crate::tunnel::{Stream, TunnelError, MAX_PAYLOAD_SIZE};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Relay buffer size; one full frame payload
pub const PIPE_BUFFER_SIZE: usize = MAX_PAYLOAD_SIZE;

/// A duplex byte endpoint
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Read some bytes; `Ok(0)` means end of stream
    async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize>;

    /// Write all of `data`
    async fn send(&self, data: &[u8]) -> crate::Result<()>;

    /// Close the endpoint. Must be idempotent.
    async fn close(&self);
}

#[async_trait]
impl Endpoint for Stream {
    async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize> {
        match self.read(buf).await {
            Ok(n) => Ok(n),
            Err(TunnelError::StreamClosed) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, data: &[u8]) -> crate::Result<()> {
        self.write(data).await?;
        Ok(())
    }

    async fn close(&self) {
        Stream::close(self).await
    }
}

/// A local plaintext connection
pub struct LocalConn {
    reader: Mutex<ReadHalf<BoxedConn>>,
    writer: Mutex<WriteHalf<BoxedConn>>,
}

impl LocalConn {
    pub fn new<T>(io: T) -> Self
    where
        T: Connection + 'static,
    {
        let boxed: BoxedConn = Box::new(io);
        let (reader, writer) = tokio::io::split(boxed);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Endpoint for LocalConn {
    async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize> {
        Ok(self.reader.lock().await.read(buf).await?)
    }

    async fn send(&self, data: &[u8]) -> crate::Result<()> {
        self.writer.lock().await.write_all(data).await?;
        Ok(())
    }

    async fn close(&self) {
        self.writer.lock().await.shutdown().await.ok();
    }
}

/// Shared "tear the bridge down" signal
#[derive(Debug)]
pub struct Teardown {
    tx: watch::Sender<bool>,
}

impl Teardown {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self { tx })
    }

    /// Fire the signal; returns true for the first caller only
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once fired
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Copy `src` into `dst` until either fails or the teardown fires, then
/// close both endpoints without waiting on them.
pub async fn pipe(src: Arc<dyn Endpoint>, dst: Arc<dyn Endpoint>, teardown: Arc<Teardown>) {
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            result = src.recv(&mut buf) => match result {
                Ok(0) => {
                    trace!("Pipe source reached EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Pipe read failed: {}", e);
                    break;
                }
            },
            _ = teardown.wait() => break,
        };

        let result = tokio::select! {
            result = dst.send(&buf[..n]) => result,
            _ = teardown.wait() => break,
        };
        if let Err(e) = result {
            debug!("Pipe write failed: {}", e);
            break;
        }
    }

    if teardown.fire() {
        tokio::spawn(async move { src.close().await });
        tokio::spawn(async move { dst.close().await });
    }
}

/// Relay in both directions. Either direction failing tears down both.
pub fn bridge(a: Arc<dyn Endpoint>, b: Arc<dyn Endpoint>) -> (JoinHandle<()>, JoinHandle<()>) {
    let teardown = Teardown::new();
    let forward = tokio::spawn(pipe(a.clone(), b.clone(), teardown.clone()));
    let backward = tokio::spawn(pipe(b, a, teardown));
    (forward, backward)
}
