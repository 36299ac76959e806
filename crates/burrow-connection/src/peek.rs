//! Peekable connection for protocol sniffing
//!
//! A [`PeekableConnection`] runs in two explicit stages. While its replay
//! buffer holds bytes it is `Replaying`: reads are served from the buffer.
//! Once the buffer is drained it switches to `Passthrough` and every later
//! read goes straight to the underlying connection.
//!
//! Bytes land in the replay buffer through the [`TeeReader`]: whatever a
//! sniffing step reads through it is also recorded, so the primary reader
//! sees those same bytes again, in order, before any live data.

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Bytes needed to classify a connection with [`Protocol::detect`]
pub const SNIFF_LEN: usize = 8;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// Replay stage of a peekable connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekState {
    /// Reads are served from the replay buffer
    Replaying,
    /// Replay buffer drained; reads hit the underlying connection
    Passthrough,
}

/// Application protocol guessed from the first bytes of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TLS handshake record (ClientHello)
    Tls,
    /// Plaintext HTTP/1.x request line
    Http,
    Unknown,
}

impl Protocol {
    pub fn detect(prefix: &[u8]) -> Self {
        // Handshake record type followed by a 3.x record version
        if prefix.len() >= 2 && prefix[0] == 0x16 && prefix[1] == 0x03 {
            return Protocol::Tls;
        }
        if HTTP_METHODS.iter().any(|method| prefix.starts_with(method)) {
            return Protocol::Http;
        }
        Protocol::Unknown
    }
}

pub struct PeekableConnection<S> {
    inner: S,
    buf: BytesMut,
    state: PeekState,
}

impl<S> PeekableConnection<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            state: PeekState::Passthrough,
        }
    }

    pub fn state(&self) -> PeekState {
        self.state
    }

    /// Bytes waiting to be replayed
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Replace the replay buffer, e.g. to hand back bytes a sniffing step
    /// consumed on its own.
    pub fn reset_buf(&mut self, bytes: &[u8]) {
        self.buf = BytesMut::from(bytes);
        self.state = if self.buf.is_empty() {
            PeekState::Passthrough
        } else {
            PeekState::Replaying
        };
    }

    /// Secondary reader that records everything it reads for replay.
    ///
    /// Borrowing `self` mutably keeps the tee and the primary reader from
    /// being used at the same time.
    pub fn tee(&mut self) -> TeeReader<'_, S> {
        TeeReader { conn: self }
    }

    /// Split into the underlying connection and any unreplayed bytes
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.inner, self.buf)
    }

    fn record(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buf.extend_from_slice(bytes);
        self.state = PeekState::Replaying;
    }
}

impl<S: AsyncRead + Unpin> PeekableConnection<S> {
    /// Read through the tee until at least `n` bytes are buffered (or the
    /// peer closes) and return the buffered prefix without consuming it.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let mut chunk = [0u8; 1024];
        while self.buf.len() < n {
            let want = (n - self.buf.len()).min(chunk.len());
            let read = self.tee().read(&mut chunk[..want]).await?;
            if read == 0 {
                break;
            }
        }
        let len = self.buf.len().min(n);
        Ok(&self.buf[..len])
    }

    /// Classify the connection from its first bytes, leaving them in place
    pub async fn sniff(&mut self) -> io::Result<Protocol> {
        let prefix = self.peek(SNIFF_LEN).await?;
        Ok(Protocol::detect(prefix))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.state {
            PeekState::Replaying => {
                let n = this.buf.len().min(buf.remaining());
                buf.put_slice(&this.buf[..n]);
                this.buf.advance(n);
                if this.buf.is_empty() {
                    // Drop the allocation; the buffer is never replayed twice
                    this.buf = BytesMut::new();
                    this.state = PeekState::Passthrough;
                }
                Poll::Ready(Ok(()))
            }
            PeekState::Passthrough => Pin::new(&mut this.inner).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reads live bytes from the underlying connection and records them in the
/// owning [`PeekableConnection`]'s replay buffer.
pub struct TeeReader<'a, S> {
    conn: &'a mut PeekableConnection<S>,
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeReader<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let conn = &mut *self.get_mut().conn;
        let before = buf.filled().len();
        ready!(Pin::new(&mut conn.inner).poll_read(cx, buf))?;
        conn.record(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
