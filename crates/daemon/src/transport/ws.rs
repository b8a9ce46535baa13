//! WebSocket subscribers.
//!
//! A client connecting to `/sessions/{id}` becomes a subscriber of that
//! session. Binary and text frames are session input; session output is
//! sent as binary frames. A session that cannot be joined is refused with a
//! close frame whose reason is the JSON fail envelope.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::Response;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ChunkSink, ChunkSource};
use crate::engine::ProcessEngine;
use crate::session::SessionManager;

/// Longest close reason a control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// Accepts WebSocket subscribers over TCP.
pub struct WsServer {
    listener: TcpListener,
}

impl WsServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept a raw TCP connection; the handshake happens in
    /// [`serve_ws_connection`].
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }
}

/// Extract `{id}` from `/sessions/{id}`.
pub fn session_id_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/sessions/")?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

fn not_found(path: &str) -> ErrorResponse {
    let body = serde_json::to_string(&Response::fail(format!("no route for {path}"))).ok();
    let mut response = ErrorResponse::new(body);
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Close reason for a refused subscription, kept within the frame limit.
fn refusal_reason(id: &str, error: &str) -> String {
    let full = Response::fail(error).with_id(id);
    match serde_json::to_string(&full) {
        Ok(reason) if reason.len() <= MAX_CLOSE_REASON => reason,
        _ => serde_json::to_string(&Response::fail("session unavailable"))
            .unwrap_or_default(),
    }
}

/// Run the handshake and relay one WebSocket subscriber.
pub async fn serve_ws_connection<S, E>(stream: S, manager: SessionManager<E>) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    E: ProcessEngine,
{
    let mut requested: Option<String> = None;
    let callback = |request: &Request, response: HandshakeResponse| {
        let path = request.uri().path();
        match session_id_from_path(path) {
            Some(id) => {
                requested = Some(id.to_string());
                Ok(response)
            }
            None => Err(not_found(path)),
        }
    };
    let ws = accept_hdr_async(stream, callback).await?;

    let Some(id) = requested else {
        return Ok(());
    };
    let (sink, source) = ws.split();

    match manager.subscribe(&id, WsSource::new(source)).await {
        Ok(handle) => {
            info!(session_id = %id, subscriber_id = %handle.id(), "WebSocket client attached");
            let stats = handle.pump(WsSink::new(sink)).await;
            info!(
                session_id = %id,
                delivered = stats.delivered,
                dropped = stats.dropped,
                "WebSocket client detached"
            );
        }
        Err(e) => {
            warn!(session_id = %id, error = %e, "WebSocket attach rejected");
            let mut sink = sink;
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: refusal_reason(&id, &e.to_string()).into(),
            };
            sink.send(WsMessage::Close(Some(frame))).await?;
        }
    }
    Ok(())
}

/// [`ChunkSource`] over the read half of a WebSocket.
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsSource<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>) -> Self {
        Self { stream }
    }
}

impl<S> ChunkSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(WsMessage::Text(text)) => return Ok(Some(Bytes::from(text))),
                Ok(WsMessage::Close(frame)) => {
                    debug!(frame = ?frame, "WebSocket peer closed");
                    return Ok(None);
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        Ok(None)
    }
}

/// [`ChunkSink`] over the write half of a WebSocket.
pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> WsSink<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self { sink }
    }
}

impl<S> ChunkSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.sink
            .send(WsMessage::Binary(chunk.to_vec()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.send(WsMessage::Close(None)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::session::SessionOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    fn manager() -> SessionManager<MemoryEngine> {
        SessionManager::new(Arc::new(MemoryEngine::echo()), SessionOptions::default(), 4)
    }

    async fn spawn_server(manager: SessionManager<MemoryEngine>) -> SocketAddr {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = server.accept().await {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let _ = serve_ws_connection(stream, manager).await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(session_id_from_path("/sessions/abc"), Some("abc"));
        assert_eq!(session_id_from_path("/sessions/abc/"), Some("abc"));
        assert_eq!(session_id_from_path("/sessions/"), None);
        assert_eq!(session_id_from_path("/sessions/a/b"), None);
        assert_eq!(session_id_from_path("/other/abc"), None);
    }

    #[test]
    fn test_refusal_reason_fits_close_frame() {
        let reason = refusal_reason("id", "session not found");
        let parsed: Response = serde_json::from_str(&reason).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.id.as_deref(), Some("id"));

        let long_id = "x".repeat(200);
        let reason = refusal_reason(&long_id, "session not found");
        assert!(reason.len() <= MAX_CLOSE_REASON);
    }

    #[tokio::test]
    async fn test_ws_relays_echo() {
        let manager = manager();
        let id = manager.create_session().await.unwrap();
        let addr = spawn_server(manager.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/sessions/{id}"))
            .await
            .unwrap();

        // Wait until the server side has subscribed before sending.
        timeout(Duration::from_secs(2), async {
            while manager.get(&id).unwrap().subscriber_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never registered");

        client
            .send(WsMessage::Binary(b"over ws".to_vec()))
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(reply, WsMessage::Binary(b"over ws".to_vec()));

        manager.close_session(&id).await.unwrap();
        let closing = timeout(Duration::from_secs(3), client.next())
            .await
            .expect("no close after session ended");
        assert!(matches!(
            closing,
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_))
        ));
    }

    #[tokio::test]
    async fn test_ws_unknown_session_gets_fail_close() {
        let addr = spawn_server(manager()).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/sessions/missing"))
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        let WsMessage::Close(Some(frame)) = message else {
            panic!("expected close frame, got {message:?}");
        };
        let envelope: Response = serde_json::from_str(&frame.reason).unwrap();
        assert!(!envelope.is_success());
        assert_eq!(envelope.id.as_deref(), Some("missing"));
    }

    #[tokio::test]
    async fn test_ws_bad_path_is_refused() {
        let addr = spawn_server(manager()).await;
        let result = connect_async(format!("ws://{addr}/nowhere")).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            Err(e) => panic!("expected HTTP refusal, got {e}"),
            Ok(_) => panic!("handshake unexpectedly succeeded"),
        }
    }
}
