//! # runhub
//!
//! A hub that runs one interactive process per session and shares its byte
//! stream with any number of remote subscribers.
//!
//! ## Overview
//!
//! - **Sessions**: each session owns one attached process. Process output is
//!   broadcast to every subscriber through a bounded per-subscriber queue;
//!   input from any subscriber is forwarded to the process.
//! - **Engines**: processes come from a PTY (`portable-pty`), a container
//!   (docker CLI), or an in-memory echo used for tests.
//! - **Control plane**: newline-delimited JSON over a Unix socket and an
//!   optional TCP listener. `Attach` turns a control connection into a raw
//!   relay.
//! - **WebSocket**: `/sessions/{id}` subscribes a WebSocket client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Orchestrator                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  Unix socket ─┐                                          │
//! │  TCP ─────────┼─▶ handler ─▶ SessionManager ─▶ Registry  │
//! │  WebSocket ───┘                    │                     │
//! │                                    ▼                     │
//! │                 Session ◀──▶ ProcessEngine (pty/docker)  │
//! │                    │                                     │
//! │                    ▼                                     │
//! │          Subscriber queues ─▶ transports                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runhub::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = Orchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`engine`]: Process engines
//! - [`session`]: Sessions, subscribers, registry and manager
//! - [`transport`]: Byte transports, including WebSocket
//! - [`ipc`]: Control-plane server, client and request handling
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod engine;
pub mod ipc;
pub mod orchestrator;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use engine::{AnyEngine, MemoryEngine, ProcessEngine};

pub use session::{
    Session, SessionError, SessionId, SessionManager, SessionState, SubscriberHandle,
};

pub use orchestrator::{Orchestrator, OrchestratorState};
