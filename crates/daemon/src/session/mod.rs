//! Session hub.
//!
//! A session shares one attached process between any number of subscribers:
//! process output is fanned out to every subscriber's bounded queue and
//! subscriber input is fanned in to the process. The [`SessionManager`]
//! creates sessions through a process engine and tracks them in a
//! [`SessionRegistry`].

pub mod hub;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod subscriber;

pub use hub::{
    InputChunk, LoopExit, Session, SessionError, SessionId, SessionInput, SessionLoop,
    SessionOptions, SessionState, SessionStats, TerminationReason,
};
pub use manager::SessionManager;
pub use queue::{ChunkQueue, OverflowPolicy, PushOutcome};
pub use registry::SessionRegistry;
pub use subscriber::{SubscriberHandle, SubscriberId, SubscriberStats};
