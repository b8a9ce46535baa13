//! Process engines.
//!
//! An engine starts the interactive process behind a session and hands back
//! its stdio as an [`Attachment`]. The session core never decides how a
//! process is created or torn down; it only calls [`ProcessEngine::attach`]
//! once and [`ProcessEngine::stop`] once.

pub mod container;
pub mod memory;
pub mod pty;

use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{EngineConfig, EngineKind};

pub use container::ContainerEngine;
pub use memory::{MemoryEngine, ProcessEnd};
pub use pty::PtyEngine;

/// Readable side of an attached process (its stdout).
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of an attached process (its stdin).
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors reported by process engines.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The process could not be started or attached.
    #[error("attach failed: {0}")]
    AttachFailed(String),

    /// The process could not be stopped.
    #[error("stop failed: {0}")]
    StopFailed(String),

    /// The engine does not know the process.
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies an attached process to its engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRef {
    /// Engine-specific identifier (container id, PTY key, ...).
    pub id: String,
    /// OS process id, when the engine knows it.
    pub pid: Option<u32>,
}

/// Parameters for attaching a new process.
#[derive(Debug, Clone, Default)]
pub struct AttachParams {
    /// Session the process will serve.
    pub session_id: String,
    /// Extra environment variables for the process.
    pub env: Vec<(String, String)>,
}

impl AttachParams {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            env: vec![("RUNHUB_SESSION_ID".to_string(), session_id.clone())],
            session_id,
        }
    }
}

/// A live process stream handle.
pub struct Attachment {
    pub process: ProcessRef,
    pub reader: ProcessReader,
    pub writer: ProcessWriter,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Starts and stops the processes behind sessions.
pub trait ProcessEngine: Send + Sync + 'static {
    /// Start a process and return its stdio.
    fn attach(
        &self,
        params: &AttachParams,
    ) -> impl Future<Output = Result<Attachment, EngineError>> + Send;

    /// Stop a process previously returned by [`ProcessEngine::attach`].
    fn stop(&self, process: &ProcessRef) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Engine selected from configuration.
pub enum AnyEngine {
    Pty(PtyEngine),
    Container(ContainerEngine),
    Echo(MemoryEngine),
}

impl AnyEngine {
    pub fn from_config(config: &EngineConfig) -> Self {
        match config.kind {
            EngineKind::Pty => AnyEngine::Pty(PtyEngine::from_config(config)),
            EngineKind::Container => AnyEngine::Container(ContainerEngine::from_config(config)),
            EngineKind::Echo => AnyEngine::Echo(MemoryEngine::echo()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnyEngine::Pty(_) => "pty",
            AnyEngine::Container(_) => "container",
            AnyEngine::Echo(_) => "echo",
        }
    }
}

impl ProcessEngine for AnyEngine {
    async fn attach(&self, params: &AttachParams) -> Result<Attachment, EngineError> {
        match self {
            AnyEngine::Pty(engine) => engine.attach(params).await,
            AnyEngine::Container(engine) => engine.attach(params).await,
            AnyEngine::Echo(engine) => engine.attach(params).await,
        }
    }

    async fn stop(&self, process: &ProcessRef) -> Result<(), EngineError> {
        match self {
            AnyEngine::Pty(engine) => engine.stop(process).await,
            AnyEngine::Container(engine) => engine.stop(process).await,
            AnyEngine::Echo(engine) => engine.stop(process).await,
        }
    }
}
