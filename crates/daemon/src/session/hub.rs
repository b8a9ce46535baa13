//! The per-session stream hub.
//!
//! A [`Session`] owns one process attachment and a set of subscribers. Its
//! [`SessionLoop`] broadcasts chunks read from the process to every
//! subscriber until the process stream ends or the session is cancelled.
//! Chunks submitted by subscribers go to a separate writer task, so a
//! process that stops reading its stdin never holds up the broadcast.
//!
//! ```text
//! process reader ──Output──▶ SessionLoop ──offer──▶ subscriber queues
//! subscriber readers ──InputChunk──▶ process writer ──write──▶ process stdin
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock};
use tokio_util::sync::CancellationToken;

use super::queue::{ChunkQueue, OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use super::subscriber::{forward_input, Subscriber, SubscriberHandle, SubscriberId, SubscriberStats};
use crate::config::SessionConfig;
use crate::engine::{Attachment, ProcessReader, ProcessRef, ProcessWriter};
use crate::transport::{ChunkSource, StreamSource, DEFAULT_CHUNK_SIZE};

/// Unique identifier for a session.
pub type SessionId = String;

/// Default capacity of the subscriber-to-process input channel.
pub const DEFAULT_INPUT_CAPACITY: usize = 64;

/// Capacity of the process-reader-to-loop event channel.
const PROCESS_EVENT_CAPACITY: usize = 16;

/// Errors from session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session exists but no longer accepts subscribers.
    #[error("session not running: {0}")]
    NotRunning(SessionId),

    /// The engine could not attach a process.
    #[error("attach failed: {0}")]
    AttachFailed(String),

    /// The engine failed to stop the process. The session was closed anyway.
    #[error("failed to stop session {id}: {reason}")]
    StopFailed { id: SessionId, reason: String },

    /// The configured session limit is reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// A session with this id is already registered.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),
}

/// Lifecycle of a session.
///
/// `Created -> Attaching -> Running -> Closed`, or `Attaching -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Attaching,
    Running,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Attaching => "attaching",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub read_chunk_size: usize,
    pub output_queue_capacity: usize,
    pub input_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            output_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            input_queue_capacity: DEFAULT_INPUT_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            output_queue_capacity: config.output_queue_capacity,
            input_queue_capacity: config.input_queue_capacity,
            overflow_policy: config.overflow_policy,
        }
    }
}

/// A chunk submitted by a subscriber for the process.
#[derive(Debug)]
pub struct InputChunk {
    pub from: SubscriberId,
    pub data: Bytes,
}

/// Receiving end of a session's input channel.
///
/// Returned once by [`Session::new`] and consumed by [`Session::start`], so a
/// session can be started with at most one attachment.
pub struct SessionInput(mpsc::Receiver<InputChunk>);

/// Why the process stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    EndOfStream,
    ReadError(String),
    /// Writing subscriber input to the process failed.
    WriteError(String),
}

/// Why a [`SessionLoop`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The session was cancelled (explicit close or shutdown).
    Cancelled,
    /// The process stream ended.
    Terminated(TerminationReason),
}

#[derive(Debug)]
enum ProcessEvent {
    Output(Bytes),
    Terminated(TerminationReason),
}

/// Counters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub subscribers: usize,
    /// Chunks read from the process and broadcast.
    pub chunks_out: u64,
    /// Subscriber chunks written to the process.
    pub chunks_in: u64,
}

/// One process attachment shared by many subscribers.
pub struct Session {
    id: SessionId,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    running: AtomicBool,
    closing: AtomicBool,
    process: Mutex<Option<ProcessRef>>,
    slot: Mutex<Option<OwnedSemaphorePermit>>,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_subscriber: AtomicU64,
    input_tx: mpsc::Sender<InputChunk>,
    cancel: CancellationToken,
    chunks_out: AtomicU64,
    chunks_in: AtomicU64,
}

impl Session {
    /// Create a session in the `Created` state.
    pub fn new(id: impl Into<SessionId>, options: SessionOptions) -> (Arc<Self>, SessionInput) {
        let (input_tx, input_rx) = mpsc::channel(options.input_queue_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Created);
        let session = Arc::new(Self {
            id: id.into(),
            options,
            state,
            running: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            process: Mutex::new(None),
            slot: Mutex::new(None),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            input_tx,
            cancel: CancellationToken::new(),
            chunks_out: AtomicU64::new(0),
            chunks_in: AtomicU64::new(0),
        });
        (session, SessionInput(input_rx))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session loop is live and accepting subscribers.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The attached process, until the session is torn down.
    pub fn process(&self) -> Option<ProcessRef> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the session reaches `Closed` or `Failed`.
    pub async fn closed(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Move to a new state. Terminal states are final.
    pub(crate) fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!(session_id = %self.id, state = %next, "Session state changed");
        }
    }

    pub(crate) fn begin_attach(&self) {
        self.set_state(SessionState::Attaching);
    }

    pub(crate) fn fail(&self) {
        self.set_state(SessionState::Failed);
    }

    /// Take ownership of the attachment, spawn the process reader and
    /// writer, and return the broadcast loop for the caller to drive.
    pub fn start(self: &Arc<Self>, attachment: Attachment, input: SessionInput) -> SessionLoop {
        let Attachment {
            process,
            reader,
            writer,
        } = attachment;

        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(process);

        let (events_tx, events_rx) = mpsc::channel(PROCESS_EVENT_CAPACITY);
        tokio::spawn(write_process(
            Arc::clone(self),
            writer,
            input.0,
            events_tx.clone(),
        ));
        tokio::spawn(read_process(
            reader,
            self.options.read_chunk_size,
            events_tx,
            self.cancel.clone(),
            self.id.clone(),
        ));

        self.running.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Running);

        SessionLoop {
            session: Arc::clone(self),
            events: events_rx,
        }
    }

    /// Register a subscriber whose input is read from `source`.
    pub async fn subscribe<S: ChunkSource>(
        self: &Arc<Self>,
        source: S,
    ) -> Result<SubscriberHandle, SessionError> {
        let subscriber = {
            let mut subscribers = self.subscribers.write().await;
            // Checked under the write lock: teardown clears `running` before
            // it takes this lock, so nothing can slip in after the release.
            if !self.is_running() {
                return Err(SessionError::NotRunning(self.id.clone()));
            }

            let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
            let subscriber = Arc::new(Subscriber::new(
                id,
                ChunkQueue::new(
                    self.options.output_queue_capacity,
                    self.options.overflow_policy,
                ),
                self.cancel.child_token(),
            ));
            subscribers.insert(id, Arc::clone(&subscriber));
            subscriber
        };

        tokio::spawn(forward_input(
            source,
            subscriber.id(),
            subscriber.done().clone(),
            self.input_tx.clone(),
            Arc::downgrade(self),
        ));

        tracing::debug!(
            session_id = %self.id,
            subscriber_id = %subscriber.id(),
            "Subscriber attached"
        );
        Ok(SubscriberHandle::new(subscriber, Arc::downgrade(self)))
    }

    /// Remove a subscriber, close its queue and fire its `done`.
    ///
    /// Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.release();
                let stats = subscriber.stats();
                tracing::debug!(
                    session_id = %self.id,
                    subscriber_id = %id,
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    undelivered = stats.queued,
                    "Subscriber detached"
                );
                true
            }
            None => false,
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscriber_ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = self.subscribers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn subscriber_stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.subscribers.read().await.get(&id).map(|s| s.stats())
    }

    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            subscribers: self.subscriber_count().await,
            chunks_out: self.chunks_out.load(Ordering::Relaxed),
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
        }
    }

    /// Offer a chunk to every subscriber registered right now.
    ///
    /// Holds the read lock for the whole pass, so a concurrent unsubscribe
    /// lands either before (no delivery) or after (full delivery).
    async fn broadcast(&self, chunk: Bytes) -> usize {
        self.chunks_out.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.values() {
            subscriber.offer(&self.id, chunk.clone());
        }
        subscribers.len()
    }

    /// Stop the loop and every reader task.
    pub(crate) fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Claim the right to tear the session down. Only the first caller wins.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Force-unsubscribe everyone. Returns how many were released.
    pub(crate) async fn release_subscribers(&self) -> usize {
        let drained: Vec<_> = self.subscribers.write().await.drain().collect();
        for (_, subscriber) in &drained {
            subscriber.release();
        }
        drained.len()
    }

    /// Keep a manager slot reserved until [`release_slot`](Self::release_slot).
    pub(crate) fn hold_slot(&self, permit: OwnedSemaphorePermit) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
    }

    pub(crate) fn release_slot(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub(crate) fn take_process(&self) -> Option<ProcessRef> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The broadcast loop of one session.
pub struct SessionLoop {
    session: Arc<Session>,
    events: mpsc::Receiver<ProcessEvent>,
}

impl SessionLoop {
    /// Run until the process stream ends, writing to the process fails, or
    /// the session is cancelled.
    ///
    /// On return the session is halted: `running` is false and every reader
    /// and writer task has been told to stop. Teardown is left to the owner.
    pub async fn run(self) -> LoopExit {
        let SessionLoop {
            session,
            mut events,
        } = self;
        let cancel = session.cancel.clone();

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break LoopExit::Cancelled,

                event = events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        session.broadcast(chunk).await;
                    }
                    Some(ProcessEvent::Terminated(reason)) => break LoopExit::Terminated(reason),
                    None => break LoopExit::Terminated(TerminationReason::EndOfStream),
                },
            }
        };

        session.halt();
        match &exit {
            LoopExit::Cancelled => {
                tracing::debug!(session_id = %session.id, "Session loop cancelled");
            }
            LoopExit::Terminated(reason) => {
                tracing::info!(session_id = %session.id, reason = ?reason, "Process stream ended");
            }
        }
        exit
    }
}

/// Write subscriber input to the process in arrival order.
///
/// A failed write ends the task and reports a termination to the loop, so
/// the session closes instead of discarding every later chunk.
async fn write_process(
    session: Arc<Session>,
    mut writer: ProcessWriter,
    mut input: mpsc::Receiver<InputChunk>,
    events: mpsc::Sender<ProcessEvent>,
) {
    let cancel = session.cancel.clone();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = input.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let write = async {
            writer.write_all(&chunk.data).await?;
            writer.flush().await
        };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = write => written,
        };

        if let Err(e) = written {
            tracing::warn!(
                session_id = %session.id,
                subscriber_id = %chunk.from,
                error = %e,
                "Failed to write subscriber input to process"
            );
            let reason = TerminationReason::WriteError(e.to_string());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = events.send(ProcessEvent::Terminated(reason)) => {}
            }
            break;
        }
        session.chunks_in.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!(session_id = %session.id, "Process writer exiting");
}

/// Read the process stream until it ends, then report exactly one
/// termination event.
async fn read_process(
    reader: ProcessReader,
    chunk_size: usize,
    events: mpsc::Sender<ProcessEvent>,
    cancel: CancellationToken,
    session_id: SessionId,
) {
    let mut source = StreamSource::with_chunk_size(reader, chunk_size);
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = source.read_chunk() => read,
        };

        let event = match read {
            Ok(Some(chunk)) => ProcessEvent::Output(chunk),
            Ok(None) => ProcessEvent::Terminated(TerminationReason::EndOfStream),
            Err(e) => ProcessEvent::Terminated(TerminationReason::ReadError(e.to_string())),
        };
        let last = matches!(event, ProcessEvent::Terminated(_));

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = events.send(event) => sent,
        };
        if sent.is_err() || last {
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "Process reader exiting");
}
