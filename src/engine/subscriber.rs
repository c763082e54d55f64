//! Subscriber side of the fan-out.
//!
//! The transport layer owns a [`Subscriber`]. The session only keeps a
//! [`SubscriberSink`], a weak link into the same queue, so a dropped
//! subscriber is detected on the next delivery and never kept alive by the
//! session.

use crate::engine::models::ChatMessage;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Identity of one attached subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscriber receives: `onBatch` and `onStatus` in one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// Ordered batch of new messages, shared by every subscriber of the session
    Batch(Arc<Vec<ChatMessage>>),
    /// Operator-visible status text
    Status(String),
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<SubscriberEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Receiving end, owned by the transport layer.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    shared: Arc<Shared>,
}

impl Subscriber {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: SubscriberId::new(),
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Non-owning link handed to the session on attach.
    pub fn sink(&self) -> SubscriberSink {
        SubscriberSink {
            id: self.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the session has closed this subscriber and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<SubscriberEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.is_closed() {
                // close と push の競合に備えてもう一度確認する
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<SubscriberEvent> {
        self.shared.queue.lock().pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Consume the subscriber as a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = SubscriberEvent> + Send + 'static {
        stream::unfold(self, |subscriber| async move {
            let event = subscriber.recv().await?;
            Some((event, subscriber))
        })
    }
}

/// Session-side link to a subscriber's queue.
#[derive(Debug, Clone)]
pub struct SubscriberSink {
    id: SubscriberId,
    shared: Weak<Shared>,
}

impl SubscriberSink {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The owning [`Subscriber`] has been dropped.
    pub fn is_dead(&self) -> bool {
        self.shared.strong_count() == 0
    }

    /// Enqueue without blocking. A full queue drops its oldest event.
    ///
    /// Returns `false` if the subscriber is gone.
    pub fn push(&self, event: SubscriberEvent) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if shared.closed.load(Ordering::Acquire) {
            return true;
        }

        {
            let mut queue = shared.queue.lock();
            if queue.len() >= shared.capacity {
                queue.pop_front();
                let dropped = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(
                        "🐢 [SUBSCRIBER] Queue full for {}, dropping oldest event (dropped={})",
                        self.id,
                        dropped
                    );
                }
            }
            queue.push_back(event);
        }
        shared.notify.notify_one();
        true
    }

    /// Mark the subscriber closed; `recv` returns `None` after draining.
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.closed.store(true, Ordering::Release);
            shared.notify.notify_one();
        }
    }
}
