//! Bounded per-subscriber output queue.
//!
//! The session loop pushes every process chunk into each subscriber's queue
//! without ever waiting. When a queue is full the configured
//! [`OverflowPolicy`] decides which chunk is discarded, so one stalled
//! subscriber never slows down the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Default number of chunks buffered per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What to discard when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued chunk to make room for the new one.
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the new chunk.
    DropNewest,
}

/// Result of [`ChunkQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The chunk was queued without loss.
    Queued,
    /// The chunk was queued after evicting the oldest one.
    DroppedOldest,
    /// The chunk was discarded because the queue is full.
    DroppedNewest,
    /// The queue is closed; the chunk was discarded.
    Closed,
}

impl PushOutcome {
    /// Whether this push lost a chunk because the queue was full.
    pub fn dropped(self) -> bool {
        matches!(self, PushOutcome::DroppedOldest | PushOutcome::DroppedNewest)
    }
}

struct QueueInner {
    chunks: VecDeque<Bytes>,
    closed: bool,
}

/// A bounded, closable FIFO of chunks with a single consumer.
pub struct ChunkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ChunkQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a chunk without waiting.
    pub fn push(&self, chunk: Bytes) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            if inner.chunks.len() < self.capacity {
                inner.chunks.push_back(chunk);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.chunks.pop_front();
                        inner.chunks.push_back(chunk);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                }
            }
        };

        if outcome.dropped() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if outcome != PushOutcome::DroppedNewest {
            self.notify.notify_one();
        }
        outcome
    }

    /// Take the next chunk, waiting for one if the queue is empty.
    ///
    /// Chunks queued before [`close`](Self::close) are still handed out;
    /// `None` is returned once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(chunk) = inner.chunks.pop_front() {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next chunk if one is queued.
    pub fn try_pop(&self) -> Option<Bytes> {
        let chunk = self.lock().chunks.pop_front()?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Some(chunk)
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Chunks waiting for the consumer.
    pub(crate) fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Chunks handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Chunks lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
