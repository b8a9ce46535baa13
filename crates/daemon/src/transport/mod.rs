//! Byte transports for subscribers and processes.
//!
//! The session core only needs two capabilities from a transport: pull the
//! next chunk of bytes ([`ChunkSource`]) and push a chunk of bytes
//! ([`ChunkSink`]). Any tokio `AsyncRead`/`AsyncWrite` can be adapted with
//! [`StreamSource`] and [`StreamSink`]; WebSocket connections are adapted in
//! [`ws`].

pub mod ws;

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reference read size: 64 KiB. Purely a buffer size, not a framing unit.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A readable byte transport.
pub trait ChunkSource: Send + 'static {
    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` once the remote side has closed the stream.
    fn read_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// A writable byte transport.
pub trait ChunkSink: Send + 'static {
    /// Write one chunk in full.
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close the write side.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// [`ChunkSource`] over any `AsyncRead`.
pub struct StreamSource<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; chunk_size.max(1)],
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R> ChunkSource for StreamSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let n = self.reader.read(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        // Copy out so a short read does not pin a full-size buffer in every queue.
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..n])))
    }
}

/// [`ChunkSink`] over any `AsyncWrite`.
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> ChunkSink for StreamSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
