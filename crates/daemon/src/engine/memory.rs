//! In-memory process engine.
//!
//! Each attach creates an in-process duplex pipe. In echo mode the far end
//! writes back whatever it reads, which gives clients something to talk to
//! without a real process. Otherwise the far end of every pipe is handed
//! out through [`MemoryEngine::next_process`], so a caller can play the role
//! of the process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AttachParams, Attachment, EngineError, ProcessEngine, ProcessRef};

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Far end of an in-memory process: read it to see session input, write it
/// to produce session output, drop it to end the process stream.
pub struct ProcessEnd {
    pub session_id: String,
    pub process: ProcessRef,
    pub stream: DuplexStream,
}

pub struct MemoryEngine {
    echo: bool,
    next_id: AtomicU64,
    live: DashMap<String, CancellationToken>,
    stopped: Mutex<Vec<String>>,
    ends_tx: mpsc::UnboundedSender<ProcessEnd>,
    ends_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ProcessEnd>>,
    fail_attach: AtomicBool,
    fail_stop: AtomicBool,
    attach_delay_ms: AtomicU64,
}

impl MemoryEngine {
    /// Engine whose process ends are handed out via [`Self::next_process`].
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Engine whose processes echo their input back as output.
    pub fn echo() -> Self {
        Self::build(true)
    }

    fn build(echo: bool) -> Self {
        let (ends_tx, ends_rx) = mpsc::unbounded_channel();
        Self {
            echo,
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
            stopped: Mutex::new(Vec::new()),
            ends_tx,
            ends_rx: tokio::sync::Mutex::new(ends_rx),
            fail_attach: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            attach_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every following attach fail (or succeed again).
    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// Make every following stop fail (or succeed again).
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Make every following attach take at least `delay`, like a container
    /// start would.
    pub fn set_attach_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.attach_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Wait for the far end of the next attached process.
    ///
    /// Never yields anything for an echo engine.
    pub async fn next_process(&self) -> Option<ProcessEnd> {
        self.ends_rx.lock().await.recv().await
    }

    /// Ids of processes that were asked to stop, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.stopped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of processes attached and not yet stopped.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngine for MemoryEngine {
    async fn attach(&self, params: &AttachParams) -> Result<Attachment, EngineError> {
        let delay = self.attach_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(EngineError::AttachFailed(
                "in-memory engine refused to attach".to_string(),
            ));
        }

        let process = ProcessRef {
            id: format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            pid: None,
        };
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(ours);
        let token = CancellationToken::new();
        self.live.insert(process.id.clone(), token.clone());

        if self.echo {
            tokio::spawn(run_echo(theirs, token, process.id.clone()));
        } else {
            let end = ProcessEnd {
                session_id: params.session_id.clone(),
                process: process.clone(),
                stream: theirs,
            };
            if self.ends_tx.send(end).is_err() {
                tracing::trace!(process_id = %process.id, "No consumer for process ends");
            }
        }

        tracing::debug!(
            process_id = %process.id,
            session_id = %params.session_id,
            echo = self.echo,
            "Attached in-memory process"
        );

        Ok(Attachment {
            process,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn stop(&self, process: &ProcessRef) -> Result<(), EngineError> {
        self.stopped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(process.id.clone());

        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::StopFailed(format!(
                "in-memory engine refused to stop {}",
                process.id
            )));
        }

        match self.live.remove(&process.id) {
            Some((_, token)) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::UnknownProcess(process.id.clone())),
        }
    }
}

async fn run_echo(stream: DuplexStream, token: CancellationToken, process_id: String) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::io::copy(&mut reader, &mut writer) => {
            if let Err(e) = result {
                tracing::debug!(process_id = %process_id, error = %e, "Echo process ended");
            }
        }
    }
}
