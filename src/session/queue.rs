//! Bounded per-client send queues with the media drop policy.
//!
//! Media classes are bounded (video 64, audio 256). When a class is full
//! the oldest queued entry of the same stream kind is dropped so the peer
//! always receives the freshest frames. Control packets use a small
//! reserved budget and never contend with media for space.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::crypto::DirectionCipher;
use crate::messages::{PacketType, StreamKind};

pub const VIDEO_QUEUE_CAP: usize = 64;
pub const AUDIO_QUEUE_CAP: usize = 256;
pub const CONTROL_RESERVE: usize = 8;

const CONGESTION_WINDOW: Duration = Duration::from_secs(2);
const CONGESTION_RATIO: f64 = 0.5;
/// Don't flag congestion until the window holds a meaningful sample.
const CONGESTION_MIN_EVENTS: u64 = 16;

/// One media payload on its way to a subscriber. The payload is a
/// refcounted view of the buffer produced by the receive worker; the last
/// queue to release it frees the allocation.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub packet_type: PacketType,
    pub kind: StreamKind,
    pub origin: u32,
    pub payload: Bytes,
}

/// Work items drained by the send worker, in order.
pub enum QueueItem {
    Media(Envelope),
    Control {
        packet_type: PacketType,
        origin: u32,
        payload: Bytes,
    },
    /// Swap the send cipher; ordered after the packet that announced it.
    InstallSendCipher(Box<DirectionCipher>),
    /// Drain complete: the send worker should exit after this item.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("send queue closed")]
    Closed,
    #[error("control reserve exhausted")]
    ControlOverflow,
}

#[derive(Default)]
struct Window {
    started: Option<Instant>,
    enqueued: u64,
    dropped: u64,
    flagged: bool,
}

struct Inner {
    items: VecDeque<QueueItem>,
    video: usize,
    audio: usize,
    control: usize,
    closed: bool,
    window: Window,
}

/// Bounded MPSC queue feeding one client's send worker.
pub struct SendQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    dropped_total: AtomicU64,
    client_id: u32,
}

impl SendQueue {
    pub fn new(client_id: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                video: 0,
                audio: 0,
                control: 0,
                closed: false,
                window: Window::default(),
            }),
            notify: Notify::new(),
            dropped_total: AtomicU64::new(0),
            client_id,
        }
    }

    /// Enqueues a media envelope, evicting the oldest same-kind entry when
    /// the class is full. Returns false if the queue is closed.
    pub fn push_media(&self, envelope: Envelope) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let kind = envelope.kind;
        let cap = match kind {
            StreamKind::Video => VIDEO_QUEUE_CAP,
            StreamKind::Audio => AUDIO_QUEUE_CAP,
        };
        let count = match kind {
            StreamKind::Video => inner.video,
            StreamKind::Audio => inner.audio,
        };
        if count >= cap {
            self.evict_oldest(&mut inner, kind);
        }
        match kind {
            StreamKind::Video => inner.video += 1,
            StreamKind::Audio => inner.audio += 1,
        }
        inner.items.push_back(QueueItem::Media(envelope));
        self.observe(&mut inner, false);
        drop(inner);
        self.notify.notify_one();
        true
    }

    fn evict_oldest(&self, inner: &mut Inner, kind: StreamKind) {
        let position = inner.items.iter().position(
            |item| matches!(item, QueueItem::Media(env) if env.kind == kind),
        );
        if let Some(position) = position {
            let _ = inner.items.remove(position);
            match kind {
                StreamKind::Video => inner.video -= 1,
                StreamKind::Audio => inner.audio -= 1,
            }
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            self.observe(inner, true);
        }
    }

    /// Tracks drops over a sliding window and emits one congestion event
    /// per window when more than half of the traffic is being shed.
    fn observe(&self, inner: &mut Inner, dropped: bool) {
        let now = Instant::now();
        let window = &mut inner.window;
        let expired = window
            .started
            .map(|start| now.duration_since(start) > CONGESTION_WINDOW)
            .unwrap_or(true);
        if expired {
            *window = Window {
                started: Some(now),
                ..Window::default()
            };
        }
        if dropped {
            window.dropped += 1;
        } else {
            window.enqueued += 1;
        }
        let total = window.dropped + window.enqueued;
        if !window.flagged
            && total >= CONGESTION_MIN_EVENTS
            && window.dropped as f64 / total as f64 > CONGESTION_RATIO
        {
            window.flagged = true;
            warn!(
                target: "asciichat::fanout",
                client_id = self.client_id,
                dropped = window.dropped,
                enqueued = window.enqueued,
                "send queue congested; shedding media"
            );
        }
    }

    /// Enqueues a control packet into the reserved budget.
    pub fn push_control(
        &self,
        packet_type: PacketType,
        origin: u32,
        payload: Bytes,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.control >= CONTROL_RESERVE {
            return Err(QueueError::ControlOverflow);
        }
        inner.control += 1;
        inner.items.push_back(QueueItem::Control {
            packet_type,
            origin,
            payload,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Orders a cipher swap after everything already queued.
    pub fn push_install_cipher(&self, cipher: DirectionCipher) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner
            .items
            .push_back(QueueItem::InstallSendCipher(Box::new(cipher)));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Marks the drain point for a graceful shutdown; items queued before
    /// it still go out.
    pub fn push_shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.items.push_back(QueueItem::Shutdown);
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Closes immediately, discarding anything still queued.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.clear();
        inner.video = 0;
        inner.audio = 0;
        inner.control = 0;
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Dequeues the next item; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    match &item {
                        QueueItem::Media(env) => match env.kind {
                            StreamKind::Video => inner.video -= 1,
                            StreamKind::Audio => inner.audio -= 1,
                        },
                        QueueItem::Control { .. } => inner.control -= 1,
                        _ => {}
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Total media entries shed since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.inner.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_env(origin: u32, tag: u8) -> Envelope {
        Envelope {
            packet_type: PacketType::ImageFrame,
            kind: StreamKind::Video,
            origin,
            payload: Bytes::from(vec![tag]),
        }
    }

    fn audio_env(origin: u32) -> Envelope {
        Envelope {
            packet_type: PacketType::AudioOpusBatch,
            kind: StreamKind::Audio,
            origin,
            payload: Bytes::from_static(b"opus"),
        }
    }

    #[tokio::test]
    async fn fifo_order_within_a_kind() {
        let queue = SendQueue::new(1);
        for tag in 0..5u8 {
            assert!(queue.push_media(video_env(1, tag)));
        }
        for expected in 0..5u8 {
            match queue.next().await.unwrap() {
                QueueItem::Media(env) => assert_eq!(env.payload[0], expected),
                _ => panic!("expected media"),
            }
        }
    }

    #[tokio::test]
    async fn full_video_class_drops_oldest_of_same_kind() {
        let queue = SendQueue::new(1);
        for tag in 0..VIDEO_QUEUE_CAP as u8 {
            queue.push_media(video_env(1, tag));
        }
        queue.push_media(audio_env(2));
        queue.push_media(video_env(1, 200));

        assert_eq!(queue.dropped_total(), 1);
        // Oldest video frame (tag 0) is gone; audio untouched.
        match queue.next().await.unwrap() {
            QueueItem::Media(env) => {
                assert_eq!(env.kind, StreamKind::Video);
                assert_eq!(env.payload[0], 1);
            }
            _ => panic!("expected media"),
        }
        assert_eq!(queue.depth(), VIDEO_QUEUE_CAP);
    }

    #[tokio::test]
    async fn control_reserve_is_independent_of_media_pressure() {
        let queue = SendQueue::new(1);
        for tag in 0..VIDEO_QUEUE_CAP as u8 {
            queue.push_media(video_env(1, tag));
        }
        for _ in 0..CONTROL_RESERVE {
            queue
                .push_control(PacketType::Pong, 0, Bytes::from_static(b"pong"))
                .unwrap();
        }
        assert!(matches!(
            queue.push_control(PacketType::Pong, 0, Bytes::new()),
            Err(QueueError::ControlOverflow)
        ));
        assert_eq!(queue.dropped_total(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items_first() {
        let queue = SendQueue::new(1);
        queue.push_media(video_env(1, 1));
        queue.push_shutdown();
        assert!(matches!(queue.next().await, Some(QueueItem::Media(_))));
        assert!(matches!(queue.next().await, Some(QueueItem::Shutdown)));
        assert!(queue.next().await.is_none());
        assert!(!queue.push_media(video_env(1, 2)));
    }

    #[tokio::test]
    async fn close_discards_and_wakes_consumer() {
        let queue = std::sync::Arc::new(SendQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap());
    }
}
