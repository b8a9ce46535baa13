//! Session subscribers.
//!
//! A subscriber is one observer of a session: a bounded output queue fed by
//! the session's broadcast, plus a reader task that forwards whatever the
//! observer's transport sends into the session's input channel. The
//! [`SubscriberHandle`] returned by subscribe is the queue's only consumer.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::hub::{InputChunk, Session};
use super::queue::{ChunkQueue, PushOutcome};
use crate::transport::{ChunkSink, ChunkSource};

/// How long a finished subscriber may spend flushing queued output to a
/// transport that is not reading.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Stable identifier of a subscriber within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Delivery counters of one subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Chunks taken from the queue by the consumer.
    pub delivered: u64,
    /// Chunks lost because the queue was full.
    pub dropped: u64,
    /// Chunks queued and not yet taken.
    pub queued: usize,
}

/// Registry entry for one subscriber.
pub(crate) struct Subscriber {
    id: SubscriberId,
    queue: ChunkQueue,
    done: CancellationToken,
    backpressured: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, queue: ChunkQueue, done: CancellationToken) -> Self {
        Self {
            id,
            queue,
            done,
            backpressured: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Queue one broadcast chunk, logging transitions in and out of overflow.
    pub(crate) fn offer(&self, session_id: &str, chunk: Bytes) -> PushOutcome {
        let outcome = self.queue.push(chunk);
        if outcome.dropped() {
            if !self.backpressured.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    session_id = %session_id,
                    subscriber_id = %self.id,
                    dropped = self.queue.dropped(),
                    policy = ?self.queue.policy(),
                    "Subscriber is backpressured, dropping output"
                );
            }
        } else if outcome == PushOutcome::Queued && self.backpressured.swap(false, Ordering::Relaxed)
        {
            tracing::debug!(
                session_id = %session_id,
                subscriber_id = %self.id,
                "Subscriber recovered from backpressure"
            );
        }
        outcome
    }

    /// Close the queue and fire `done`. Idempotent.
    pub(crate) fn release(&self) {
        self.queue.close();
        self.done.cancel();
    }

    pub(crate) fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            delivered: self.queue.delivered(),
            dropped: self.queue.dropped(),
            queued: self.queue.len(),
        }
    }
}

/// Consumer side of a subscription.
///
/// Dropping the handle does not unsubscribe; the subscription ends when the
/// transport reader sees end-of-stream, on [`unsubscribe`](Self::unsubscribe),
/// or when the session closes.
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
    session: Weak<Session>,
}

impl SubscriberHandle {
    pub(crate) fn new(subscriber: Arc<Subscriber>, session: Weak<Session>) -> Self {
        Self {
            subscriber,
            session,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.subscriber.id
    }

    /// Next output chunk, or `None` once the subscription has ended and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.subscriber.queue.pop().await
    }

    /// Next output chunk if one is already queued.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.subscriber.queue.try_pop()
    }

    /// Resolves once the subscription has ended.
    pub async fn done(&self) {
        self.subscriber.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.subscriber.done.is_cancelled()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.subscriber.stats()
    }

    /// Leave the session. Returns `false` if already unsubscribed.
    pub async fn unsubscribe(&self) -> bool {
        match self.session.upgrade() {
            Some(session) => session.unsubscribe(self.subscriber.id).await,
            None => {
                let was_live = !self.subscriber.done.is_cancelled();
                self.subscriber.release();
                was_live
            }
        }
    }

    /// Drain the output queue into `sink` until the subscription ends.
    ///
    /// A write error unsubscribes. Once the subscription has ended, output
    /// that is already queued is still flushed, bounded by a short grace
    /// period. The sink is closed on return.
    pub async fn pump<K: ChunkSink>(self, mut sink: K) -> SubscriberStats {
        let done = self.subscriber.done.clone();

        while let Some(chunk) = self.recv().await {
            let result = {
                let write = sink.write_chunk(chunk);
                tokio::pin!(write);
                if done.is_cancelled() {
                    flush_within_grace(write).await
                } else {
                    let finished = tokio::select! {
                        result = &mut write => Some(result),
                        _ = done.cancelled() => None,
                    };
                    match finished {
                        Some(result) => result,
                        None => flush_within_grace(write).await,
                    }
                }
            };

            if let Err(e) = result {
                tracing::warn!(
                    subscriber_id = %self.subscriber.id,
                    error = %e,
                    "Subscriber transport write failed"
                );
                self.unsubscribe().await;
                break;
            }
        }

        if tokio::time::timeout(DRAIN_GRACE, sink.close()).await.is_err() {
            tracing::debug!(subscriber_id = %self.subscriber.id, "Timed out closing subscriber transport");
        }
        self.stats()
    }
}

async fn flush_within_grace<F>(write: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    tokio::time::timeout(DRAIN_GRACE, write)
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "transport not reading after subscription ended",
            ))
        })
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.subscriber.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Forward transport input into the session until the transport closes or
/// the subscription ends, then unsubscribe.
pub(crate) async fn forward_input<S: ChunkSource>(
    mut source: S,
    subscriber: SubscriberId,
    done: CancellationToken,
    input: mpsc::Sender<InputChunk>,
    session: Weak<Session>,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            read = source.read_chunk() => read,
        };

        match read {
            Ok(Some(data)) => {
                let chunk = InputChunk {
                    from: subscriber,
                    data,
                };
                let sent = tokio::select! {
                    biased;
                    _ = done.cancelled() => return,
                    sent = input.send(chunk) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(subscriber_id = %subscriber, "Subscriber transport closed");
                break;
            }
            Err(e) => {
                tracing::debug!(subscriber_id = %subscriber, error = %e, "Subscriber transport read failed");
                break;
            }
        }
    }

    if let Some(session) = session.upgrade() {
        session.unsubscribe(subscriber).await;
    }
}
