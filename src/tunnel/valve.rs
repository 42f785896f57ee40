//! Session-wide flow control
//!
//! One `Valve` is shared by every stream of a session. Each direction has
//! a token-bucket rate and an absolute byte cap ("credit"). Rate waits
//! sleep; cap exhaustion parks the caller until credit is added or the
//! valve is closed. Neither case drops data.

use super::TunnelError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Rate sentinel meaning "no rate limit" (bytes per second)
pub const UNLIMITED_RATE: f64 = 1e12;

/// Credit sentinel meaning "no cap" (bytes)
pub const UNLIMITED_CREDIT: u64 = 1_000_000_000_000_000;

/// Sleeps shorter than this are skipped
const MIN_SLEEP: Duration = Duration::from_micros(100);

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// One direction of the valve
struct Lane {
    /// Bytes per second; also the burst size
    rate: f64,
    bucket: Mutex<Bucket>,
    used: AtomicU64,
    cap: AtomicU64,
}

impl Lane {
    fn new(rate: f64, credit: u64) -> Self {
        let rate = if rate > 0.0 { rate } else { UNLIMITED_RATE };
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last: Instant::now(),
            }),
            used: AtomicU64::new(0),
            cap: AtomicU64::new(credit),
        }
    }

    /// Take `n` tokens, possibly going into debt; returns how long to wait
    /// for the debt to clear
    fn take_tokens(&self, n: u64) -> Duration {
        if self.rate >= UNLIMITED_RATE {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last = now;
        bucket.tokens -= n as f64;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate)
        }
    }

    /// Reserve `n` bytes against the cap. The counter never passes the cap.
    fn try_reserve(&self, n: u64) -> bool {
        let cap = self.cap.load(Ordering::Acquire);
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let next = match used.checked_add(n) {
                Some(next) if next <= cap => next,
                _ => return false,
            };
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }
}

/// Directional rate and cap gate for one session
pub struct Valve {
    up: Lane,
    down: Lane,
    closed: AtomicBool,
    notify: Notify,
}

impl Valve {
    /// Create a valve. Rates are bytes per second, credits are absolute
    /// byte caps.
    pub fn new(up_rate: f64, down_rate: f64, up_credit: u64, down_credit: u64) -> Self {
        Self {
            up: Lane::new(up_rate, up_credit),
            down: Lane::new(down_rate, down_credit),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// A valve that never limits
    pub fn unlimited() -> Self {
        Self::new(UNLIMITED_RATE, UNLIMITED_RATE, UNLIMITED_CREDIT, UNLIMITED_CREDIT)
    }

    /// Meter `n` outbound bytes
    pub async fn wait_up(&self, n: usize) -> Result<(), TunnelError> {
        self.wait(&self.up, n as u64).await
    }

    /// Meter `n` inbound bytes
    pub async fn wait_down(&self, n: usize) -> Result<(), TunnelError> {
        self.wait(&self.down, n as u64).await
    }

    async fn wait(&self, lane: &Lane, n: u64) -> Result<(), TunnelError> {
        let delay = lane.take_tokens(n);
        if delay >= MIN_SLEEP {
            trace!("Valve rate wait {:?} for {} bytes", delay, n);
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return Err(TunnelError::SessionBroken);
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut notified => {}
            }
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(TunnelError::SessionBroken);
            }
            if lane.try_reserve(n) {
                return Ok(());
            }
            trace!("Valve cap reached, waiting for credit ({} bytes)", n);
            notified.await;
        }
    }

    /// Raise the upload cap by `n` bytes
    pub fn add_up_credit(&self, n: u64) {
        self.up.cap.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Raise the download cap by `n` bytes
    pub fn add_down_credit(&self, n: u64) {
        self.down.cap.fetch_add(n, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn up_used(&self) -> u64 {
        self.up.used.load(Ordering::Acquire)
    }

    pub fn down_used(&self) -> u64 {
        self.down.used.load(Ordering::Acquire)
    }

    pub fn up_credit(&self) -> u64 {
        self.up.cap.load(Ordering::Acquire)
    }

    pub fn down_credit(&self) -> u64 {
        self.down.cap.load(Ordering::Acquire)
    }

    /// Fail all current and future waits
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Valve {
    fn default() -> Self {
        Self::unlimited()
    }
}
