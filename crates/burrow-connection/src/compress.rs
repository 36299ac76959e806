//! Streaming deflate compression layer
//!
//! Every write is compressed and sync-flushed, so the peer can decode it as
//! soon as it arrives; shutdown finishes the deflate stream before closing
//! the inner write side. Codecs and the read buffer come from the shared
//! [`Pool`] and go back to it exactly once.

use crate::pool::Pool;
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Size of the compressed-input read buffer
const READ_BUF_SIZE: usize = 16 * 1024;

/// Largest plaintext chunk compressed per `poll_write`
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Output growth step while compressing
const OUTPUT_STEP: usize = 4 * 1024;

fn codec_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "compression stream already shut down")
}

/// Compressing/decompressing connection wrapper
pub struct CompressStream<S> {
    inner: S,
    pool: Arc<Pool>,

    compressor: Option<Compress>,
    // Compressed bytes accepted from the caller but not yet written to `inner`
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,

    decompressor: Option<Decompress>,
    read_buf: Vec<u8>,
    read_start: usize,
    read_end: usize,
    read_eof: bool,
    stream_end: bool,
    // The last decompress call produced output, so the decoder may still
    // hold decoded bytes even with no input left
    inflating: bool,
}

impl<S> CompressStream<S> {
    pub fn new(inner: S, pool: Arc<Pool>) -> Self {
        let compressor = pool.acquire_compressor();
        let decompressor = pool.acquire_decompressor();
        let read_buf = pool.acquire_buf(READ_BUF_SIZE);
        Self {
            inner,
            pool,
            compressor: Some(compressor),
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
            decompressor: Some(decompressor),
            read_buf,
            read_start: 0,
            read_end: 0,
            read_eof: false,
            stream_end: false,
            inflating: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Run `input` through the compressor, leaving the output in `pending`.
    fn compress_into(&mut self, input: &[u8], flush: FlushCompress) -> io::Result<()> {
        let compressor = self.compressor.as_mut().ok_or_else(released)?;
        self.pending.clear();
        self.pending_pos = 0;

        let start_in = compressor.total_in();
        loop {
            if self.pending.capacity() - self.pending.len() < 64 {
                self.pending.reserve(OUTPUT_STEP);
            }
            let consumed = (compressor.total_in() - start_in) as usize;
            let status = compressor
                .compress_vec(&input[consumed..], &mut self.pending, flush)
                .map_err(codec_error)?;

            let consumed = (compressor.total_in() - start_in) as usize;
            let has_room = self.pending.len() < self.pending.capacity();
            // A flush is complete once all input is in and the output was not
            // filled to the brim
            if status == Status::StreamEnd || (consumed == input.len() && has_room) {
                return Ok(());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> CompressStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> Drop for CompressStream<S> {
    fn drop(&mut self) {
        if let Some(compressor) = self.compressor.take() {
            self.pool.release_compressor(compressor);
        }
        if let Some(decompressor) = self.decompressor.take() {
            self.pool.release_decompressor(decompressor);
        }
        self.pool.release_buf(std::mem::take(&mut self.read_buf));
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompressStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.stream_end || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if this.read_start < this.read_end || this.inflating {
                let decompressor = this.decompressor.as_mut().ok_or_else(released)?;
                let before_in = decompressor.total_in();
                let before_out = decompressor.total_out();

                let out = buf.initialize_unfilled();
                let status = decompressor
                    .decompress(
                        &this.read_buf[this.read_start..this.read_end],
                        out,
                        FlushDecompress::None,
                    )
                    .map_err(codec_error)?;

                let consumed = (decompressor.total_in() - before_in) as usize;
                let produced = (decompressor.total_out() - before_out) as usize;
                this.read_start += consumed;
                buf.advance(produced);
                this.inflating = produced > 0;

                if status == Status::StreamEnd {
                    this.stream_end = true;
                }
                if produced > 0 || this.stream_end {
                    return Poll::Ready(Ok(()));
                }
                if consumed > 0 {
                    continue;
                }
                // No progress: the decoder needs more input
                this.inflating = false;
            }

            if this.read_eof {
                if this.read_start < this.read_end {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "compressed stream truncated",
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            // Compact before reading more input
            if this.read_start > 0 {
                this.read_buf.copy_within(this.read_start..this.read_end, 0);
                this.read_end -= this.read_start;
                this.read_start = 0;
            }
            if this.read_end == this.read_buf.len() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "compressed block exceeds read buffer",
                )));
            }

            let mut input = ReadBuf::new(&mut this.read_buf[this.read_end..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut input))?;
            let n = input.filled().len();
            if n == 0 {
                this.read_eof = true;
            }
            this.read_end += n;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompressStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if this.finished {
            return Poll::Ready(Err(released()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_WRITE_CHUNK);
        this.compress_into(&buf[..n], FlushCompress::Sync)?;

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if !this.finished {
            this.compress_into(&[], FlushCompress::Finish)?;
            this.finished = true;
            // The write side is done; hand the compressor back right away
            if let Some(compressor) = this.compressor.take() {
                this.pool.release_compressor(compressor);
            }
            ready!(this.poll_drain(cx))?;
        }

        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip() {
        let pool = Arc::new(Pool::new());
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = CompressStream::new(client, pool.clone());
        let mut reader = CompressStream::new(server, pool.clone());

        let data = b"compress me, compress me, compress me, compress me".repeat(200);
        let expected = data.clone();

        let write_task = tokio::spawn(async move {
            for chunk in data.chunks(333) {
                writer.write_all(chunk).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        write_task.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_each_write_is_decodable_immediately() {
        let pool = Arc::new(Pool::new());
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = CompressStream::new(client, pool.clone());
        let mut reader = CompressStream::new(server, pool.clone());

        // No shutdown: the sync flush alone must make the message readable
        writer.write_all(b"ping").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        writer.write_all(b"pong").await.unwrap();
        writer.flush().await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    async fn read_flushed_in_chunks(payload_len: usize, chunk: usize) {
        let pool = Arc::new(Pool::new());
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut writer = CompressStream::new(client, pool.clone());
        let mut reader = CompressStream::new(server, pool);

        // Highly compressible, flushed but not shut down: the peer is still
        // waiting for a reply, so no more wire bytes will come
        writer.write_all(&vec![b'a'; payload_len]).await.unwrap();
        writer.flush().await.unwrap();

        let mut received = 0;
        let mut buf = vec![0u8; chunk];
        while received < payload_len {
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                reader.read(&mut buf),
            )
            .await
            .unwrap_or_else(|_| panic!("stalled after {} of {} bytes", received, payload_len))
            .unwrap();
            assert!(n > 0);
            assert!(buf[..n].iter().all(|&b| b == b'a'));
            received += n;
        }
        assert_eq!(received, payload_len);
    }

    #[tokio::test]
    async fn test_flushed_data_readable_in_small_chunks() {
        read_flushed_in_chunks(20_000, 1000).await;
    }

    #[tokio::test]
    async fn test_flushed_data_readable_in_relay_sized_chunks() {
        read_flushed_in_chunks(64 * 1024, 16 * 1024).await;
    }

    #[tokio::test]
    async fn test_compresses_repetitive_data() {
        let pool = Arc::new(Pool::new());
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut writer = CompressStream::new(client, pool);

        writer.write_all(&[b'a'; 10_000]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert!(wire.len() < 1000, "wire size {}", wire.len());
    }

    #[tokio::test]
    async fn test_codecs_return_to_pool_once() {
        let pool = Arc::new(Pool::new());
        let (client, _server) = tokio::io::duplex(1024);

        let mut stream = CompressStream::new(client, pool.clone());
        assert_eq!(pool.idle_codecs(), (0, 0));

        stream.shutdown().await.unwrap();
        assert_eq!(pool.idle_codecs(), (1, 0));

        // Second shutdown is a no-op for the codecs
        stream.shutdown().await.unwrap();
        assert_eq!(pool.idle_codecs(), (1, 0));

        drop(stream);
        assert_eq!(pool.idle_codecs(), (1, 1));
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let pool = Arc::new(Pool::new());
        let (client, _server) = tokio::io::duplex(1024);
        let mut stream = CompressStream::new(client, pool);

        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_input_is_invalid_data() {
        let pool = Arc::new(Pool::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = CompressStream::new(server, pool);

        client.write_all(&[0xff; 64]).await.unwrap();
        drop(client);

        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
