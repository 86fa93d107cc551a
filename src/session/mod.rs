//! Per-client session state on the server side.
//!
//! A session is created once the handshake completes and destroyed on
//! disconnect, timeout, protocol violation or fatal crypto error. Exactly
//! one receive worker and one send worker serve each session; everything
//! here that both touch is atomic or lock-guarded.

pub mod limiter;
pub mod queue;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::messages::StreamKind;

pub use limiter::{Budget, Decision, EventKind, RateConfig, RateLimiter, Subject};
pub use queue::{Envelope, QueueError, QueueItem, SendQueue};

/// Why a session ended; logged with the close event and echoed in the
/// synthesized CLIENT_LEAVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    Timeout,
    ProtocolViolation,
    CryptoFailure,
    TransportError,
    RateLimited,
    ServerShutdown,
}

/// One connected client.
pub struct ClientSession {
    pub id: u32,
    pub name: String,
    pub addr: IpAddr,
    pub connected_at: Instant,
    capabilities: AtomicU32,
    subscriptions: AtomicU32,
    pub queue: Arc<SendQueue>,
    last_pong: Mutex<Instant>,
    /// Cancelling tears down both workers of this session.
    pub cancel: CancellationToken,
    forced_close: Mutex<Option<CloseReason>>,
}

impl ClientSession {
    pub fn new(
        id: u32,
        name: String,
        addr: IpAddr,
        capabilities: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            name,
            addr,
            connected_at: Instant::now(),
            capabilities: AtomicU32::new(capabilities),
            subscriptions: AtomicU32::new(0),
            queue: Arc::new(SendQueue::new(id)),
            last_pong: Mutex::new(Instant::now()),
            cancel,
            forced_close: Mutex::new(None),
        }
    }

    /// Tears the session down from outside the worker pair (liveness
    /// reaper, shutdown), recording why.
    pub fn force_close(&self, reason: CloseReason) {
        *self.forced_close.lock() = Some(reason);
        self.queue.close();
        self.cancel.cancel();
    }

    pub fn forced_reason(&self) -> Option<CloseReason> {
        *self.forced_close.lock()
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Relaxed)
    }

    pub fn set_capabilities(&self, capabilities: u32) {
        self.capabilities.store(capabilities, Ordering::Relaxed);
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, kinds: u32) {
        self.subscriptions.fetch_or(kinds, Ordering::Relaxed);
    }

    pub fn unsubscribe(&self, kinds: u32) {
        self.subscriptions.fetch_and(!kinds, Ordering::Relaxed);
    }

    /// Whether this client wants frames of `kind`.
    pub fn wants(&self, kind: StreamKind) -> bool {
        self.subscriptions() & kind.subscription_bit() != 0
    }

    pub fn touch_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn since_last_pong(&self) -> std::time::Duration {
        self.last_pong.lock().elapsed()
    }

    /// Media entries shed from this client's queue since connect.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped_total()
    }
}
