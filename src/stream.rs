//! Connection wrappers used while taking over a tunnel.
//!
//! All of them delegate writes untouched and only bend the read side:
//! [`PrefixedStream`] re-surfaces bytes that were consumed before the
//! wrapper existed, [`ReplayStream`] feeds an already-peeked ClientHello
//! back to a TLS engine, [`CaptureStream`] tees reads into a shared buffer,
//! and [`SingleConnIncoming`] lets a hyper server serve one pre-established
//! connection.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::server::accept::Accept;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps a stream so already-consumed bytes are read first, then the
/// underlying socket. The prefix is released once exhausted.
#[derive(Debug)]
pub struct PrefixedStream<IO> {
    io: IO,
    prefix: Bytes,
}

impl<IO> PrefixedStream<IO> {
    /// Puts `prefix` in front of whatever `io` yields next.
    pub fn new(io: IO, prefix: Bytes) -> Self {
        PrefixedStream { io, prefix }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for PrefixedStream<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Replays a predetermined byte slice on the first reads, before the
/// underlying socket is touched. Single-use: once the slice is drained the
/// wrapper is transparent.
#[derive(Debug)]
pub struct ReplayStream<IO> {
    io: IO,
    replay: Bytes,
    replayed: bool,
}

impl<IO> ReplayStream<IO> {
    /// Seeds the stream so `replay` comes out of the first reads.
    pub fn new(io: IO, replay: Bytes) -> Self {
        ReplayStream {
            io,
            replay,
            replayed: false,
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for ReplayStream<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.replayed && !self.replay.is_empty() {
            let n = self.replay.len().min(buf.remaining());
            buf.put_slice(&self.replay.split_to(n));
            if self.replay.is_empty() {
                self.replayed = true;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for ReplayStream<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Shared buffer a [`CaptureStream`] tees into.
pub type CaptureBuffer = Arc<Mutex<Vec<u8>>>;

/// Tees every byte read into a caller-provided buffer, so the exact wire
/// bytes of a request survive parsing.
#[derive(Debug)]
pub struct CaptureStream<IO> {
    io: IO,
    capture: CaptureBuffer,
}

impl<IO> CaptureStream<IO> {
    /// Captures all reads from `io` into `capture`.
    pub fn new(io: IO, capture: CaptureBuffer) -> Self {
        CaptureStream { io, capture }
    }

    /// Gives the wrapped stream back.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for CaptureStream<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                self.capture
                    .lock()
                    .expect("capture buffer poisoned")
                    .extend_from_slice(read);
            }
        }
        poll
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for CaptureStream<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// An accept source that yields exactly one pre-established connection and
/// then ends. Feeding this to a hyper server scopes the server to a single
/// tunnel.
#[derive(Debug)]
pub struct SingleConnIncoming<IO> {
    conn: Option<IO>,
}

impl<IO> SingleConnIncoming<IO> {
    /// Wraps `conn` for a one-shot accept.
    pub fn new(conn: IO) -> Self {
        SingleConnIncoming { conn: Some(conn) }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Accept for SingleConnIncoming<IO> {
    type Conn = IO;
    type Error = io::Error;

    fn poll_accept(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Self::Conn>>> {
        Poll::Ready(self.get_mut().conn.take().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefixed_stream_drains_prefix_first() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();

        let mut stream = PrefixedStream::new(server, Bytes::from_static(b"hello"));
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn prefixed_stream_with_small_reads() {
        let (_client, server) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(server, Bytes::from_static(b"abcdef"));

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ef");
    }

    #[tokio::test]
    async fn replay_stream_hands_back_peeked_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"tail").await.unwrap();

        let mut stream = ReplayStream::new(server, Bytes::from_static(b"peeked"));
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"peekedtail");
    }

    #[tokio::test]
    async fn capture_stream_tees_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let capture: CaptureBuffer = Arc::default();
        let mut stream = CaptureStream::new(server, capture.clone());

        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(capture.lock().unwrap().as_slice(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn single_conn_incoming_yields_once() {
        let (_client, server) = tokio::io::duplex(64);
        let mut incoming = SingleConnIncoming::new(server);

        let first =
            std::future::poll_fn(|cx| Poll::Ready(Pin::new(&mut incoming).poll_accept(cx))).await;
        assert!(matches!(first, Poll::Ready(Some(Ok(_)))));

        let second =
            std::future::poll_fn(|cx| Poll::Ready(Pin::new(&mut incoming).poll_accept(cx))).await;
        assert!(matches!(second, Poll::Ready(None)));
    }
}
