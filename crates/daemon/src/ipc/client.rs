//! Control-plane client.
//!
//! Connects to the daemon's Unix socket (or TCP listener), sends requests
//! and reads replies. After a successful attach the client can be turned
//! into a raw relay with [`IpcClient::into_relay`].

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{codec, Reply, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};

use super::server::{read_line, write_line, IpcError};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for the daemon's control protocol.
pub struct IpcClient<S = UnixStream> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    timeout: Duration,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

impl IpcClient<UnixStream> {
    /// Connect to the daemon at the specified socket path.
    ///
    /// An error typically means the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }
}

impl IpcClient<TcpStream> {
    /// Connect to a daemon's TCP listener.
    pub async fn connect_tcp(addr: &str) -> Result<Self, IpcError> {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, timeout))
    }
}

impl<S> IpcClient<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn from_stream(stream: S, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its reply.
    pub async fn send(&mut self, request: &Request) -> Result<Reply, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: &Request) -> Result<Reply, IpcError> {
        write_line(&mut self.writer, request).await?;

        match read_line(&mut self.reader).await? {
            Some(line) => Ok(codec::decode_line(&line)?),
            None => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            ))),
        }
    }

    async fn send_expecting_response(&mut self, request: &Request) -> Result<Response, IpcError> {
        match self.send(request).await? {
            Reply::Response(response) => Ok(response),
            other => Err(IpcError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Check that the daemon is responsive.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(&Request::Ping).await?, Reply::Pong(p) if p.pong))
    }

    /// Ask the daemon to start a new session.
    pub async fn new_session(&mut self) -> Result<Response, IpcError> {
        self.send_expecting_response(&Request::NewSession).await
    }

    /// Ids of all live sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<String>, IpcError> {
        match self.send(&Request::ListSessions).await? {
            Reply::Sessions(list) => Ok(list.ids),
            other => Err(IpcError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Close a session by id.
    pub async fn close_session(&mut self, id: &str) -> Result<Response, IpcError> {
        self.send_expecting_response(&Request::CloseSession { id: id.to_string() })
            .await
    }

    /// Subscribe this connection to a session.
    ///
    /// On a `success` envelope the connection now carries raw session bytes;
    /// continue with [`into_relay`](Self::into_relay).
    pub async fn attach(&mut self, id: &str) -> Result<Response, IpcError> {
        self.send_expecting_response(&Request::Attach { id: id.to_string() })
            .await
    }

    /// Take the connection apart for relaying raw bytes.
    pub fn into_relay(self) -> (BufReader<ReadHalf<S>>, WriteHalf<S>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use protocol::{Pong, SessionList};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = IpcClient::connect(&socket_path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, Request::Ping);
            conn.send(&Reply::Pong(Pong::new())).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_list_sessions() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut conn = crate::ipc::IpcConnection::new(server_io);
            conn.read_request().await.unwrap();
            conn.send(&Reply::Sessions(SessionList {
                ids: vec!["a".to_string(), "b".to_string()],
            }))
            .await
            .unwrap();
        });

        let mut client = IpcClient::from_stream(client_io, Duration::from_secs(1));
        assert_eq!(client.list_sessions().await.unwrap(), vec!["a", "b"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_rejects_wrong_reply_kind() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut conn = crate::ipc::IpcConnection::new(server_io);
            conn.read_request().await.unwrap();
            conn.send(&Reply::Pong(Pong::new())).await.unwrap();
        });

        let mut client = IpcClient::from_stream(client_io, Duration::from_secs(1));
        let result = client.new_session().await;
        assert!(matches!(result, Err(IpcError::UnexpectedReply(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_times_out() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let mut client = IpcClient::from_stream(client_io, Duration::from_millis(50));
        let result = client.ping().await;
        assert!(matches!(result, Err(IpcError::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
    }
}
