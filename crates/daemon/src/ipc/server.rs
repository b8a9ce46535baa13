//! Control-plane listeners.
//!
//! [`IpcServer`] listens on a Unix Domain Socket and [`TcpServer`] on a TCP
//! address; both yield [`IpcConnection`]s speaking the newline-delimited
//! JSON protocol.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use protocol::codec::{self, MAX_LINE_LENGTH};
use protocol::{ProtocolError, Request};
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A server that listens for control connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // A stale socket from a previous run blocks the bind.
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection<UnixStream>, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A server that accepts control connections over TCP.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(addr: &str) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<(IpcConnection<TcpStream>, SocketAddr), io::Error> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((IpcConnection::new(stream), addr))
    }
}

/// A control connection.
///
/// Wraps a byte stream and reads requests / writes replies as one JSON value
/// per line. After an attach the connection is taken apart with
/// [`into_parts`](Self::into_parts) and used as a raw relay.
pub struct IpcConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S> IpcConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<Request>, IpcError> {
        match read_line(&mut self.reader).await? {
            Some(line) => Ok(Some(codec::decode_line(&line)?)),
            None => Ok(None),
        }
    }

    /// Send one reply line to the client.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        write_line(&mut self.writer, message).await
    }

    /// Split into the buffered read side and the write side.
    ///
    /// Bytes the client sent after its last request line stay in the
    /// returned reader's buffer.
    pub fn into_parts(self) -> (BufReader<ReadHalf<S>>, WriteHalf<S>) {
        (self.reader, self.writer)
    }
}

/// Read one `\n`-terminated line, refusing lines over the protocol limit.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>, IpcError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    let bytes_read = reader.take(limit).read_line(&mut line).await?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && bytes_read as u64 == limit {
        return Err(IpcError::Protocol(ProtocolError::LineTooLong {
            size: bytes_read,
            max: MAX_LINE_LENGTH,
        }));
    }
    Ok(Some(line))
}

pub(crate) async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = codec::encode_line(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Errors that can occur during control-plane communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon answered with a reply of the wrong kind.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}
