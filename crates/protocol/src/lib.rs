//! # runhub protocol
//!
//! Control-plane wire types shared by the runhub daemon and its clients.
//!
//! ## Overview
//!
//! A control connection exchanges newline-delimited JSON:
//!
//! ```text
//! client                          daemon
//!   "NewSession"          ──▶
//!                         ◀──  {"status":"success","id":"…"}
//!   {"Attach":{"id":"…"}} ──▶
//!                         ◀──  {"status":"success","id":"…"}
//!   raw bytes             ◀─▶  raw bytes (session relay)
//! ```
//!
//! Session payload bytes are opaque; the protocol never frames them.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{codec, Request, Response};
//!
//! let line = codec::encode_line(&Request::ListSessions).unwrap();
//! assert_eq!(line, b"\"ListSessions\"\n");
//!
//! let reply: Response = codec::decode_line(r#"{"status":"fail","error":"nope"}"#).unwrap();
//! assert!(!reply.is_success());
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: requests, response envelope, session list
//! - [`codec`]: line encoding and decoding
//! - [`error`]: error types

pub mod codec;
pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{Pong, Reply, Request, Response, SessionList, Status};
