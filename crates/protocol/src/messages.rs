//! Control-plane message definitions for runhub.
//!
//! Requests and replies travel as newline-delimited JSON. The reply to
//! every session operation is a [`Response`] envelope carrying a
//! `status` of `"success"` or `"fail"`, an optional session `id` and an
//! optional `error` message.

use serde::{Deserialize, Serialize};

/// Requests a client can send over a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Check that the daemon is alive.
    Ping,
    /// Attach a new process and open a session for it.
    NewSession,
    /// List the ids of all live sessions.
    ListSessions,
    /// Stop the process behind a session and drop the session.
    CloseSession {
        /// Session to close.
        id: String,
    },
    /// Subscribe to a session.
    ///
    /// After a `success` reply the connection carries raw session bytes in
    /// both directions and no further requests are read from it.
    Attach {
        /// Session to attach to.
        id: String,
    },
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

/// Response envelope for session operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A `success` envelope, optionally naming the session it concerns.
    pub fn success(id: Option<String>) -> Self {
        Self {
            status: Status::Success,
            id,
            error: None,
        }
    }

    /// A `fail` envelope carrying a human-readable message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            id: None,
            error: Some(error.into()),
        }
    }

    /// Attach the session id to a `fail` envelope.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Reply to [`Request::ListSessions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    pub ids: Vec<String>,
}

/// Every reply a control connection can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Envelope for session operations.
    Response(Response),
    /// Session listing.
    Sessions(SessionList),
    /// Liveness answer.
    Pong(Pong),
}

/// Liveness answer to [`Request::Ping`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

impl Pong {
    pub fn new() -> Self {
        Self { pong: true }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

impl From<SessionList> for Reply {
    fn from(list: SessionList) -> Self {
        Reply::Sessions(list)
    }
}
