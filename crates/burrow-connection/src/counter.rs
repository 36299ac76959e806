//! Byte-accurate traffic accounting on a live connection

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Inbound/outbound byte counters shared between a connection and telemetry.
///
/// Each direction keeps a sample counter (read-and-clear via `sample`) and a
/// lifetime total that only ever grows.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    inbound: AtomicU64,
    outbound: AtomicU64,
    total_inbound: AtomicU64,
    total_outbound: AtomicU64,
}

/// Bytes moved since the previous sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub inbound: u64,
    pub outbound: u64,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inbound(&self, n: u64) {
        self.inbound.fetch_add(n, Ordering::Relaxed);
        self.total_inbound.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_outbound(&self, n: u64) {
        self.outbound.fetch_add(n, Ordering::Relaxed);
        self.total_outbound.fetch_add(n, Ordering::Relaxed);
    }

    /// Inbound bytes since the last inbound sample; resets the counter
    pub fn sample_inbound(&self) -> u64 {
        self.inbound.swap(0, Ordering::Relaxed)
    }

    /// Outbound bytes since the last outbound sample; resets the counter
    pub fn sample_outbound(&self) -> u64 {
        self.outbound.swap(0, Ordering::Relaxed)
    }

    /// Read and clear both directions
    pub fn sample(&self) -> TrafficSample {
        TrafficSample {
            inbound: self.sample_inbound(),
            outbound: self.sample_outbound(),
        }
    }

    pub fn total_inbound(&self) -> u64 {
        self.total_inbound.load(Ordering::Relaxed)
    }

    pub fn total_outbound(&self) -> u64 {
        self.total_outbound.load(Ordering::Relaxed)
    }
}

/// Connection wrapper feeding a `TrafficCounter`.
///
/// Only bytes the inner stream reports as transferred are counted; a failed
/// call adds nothing.
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<TrafficCounter>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<TrafficCounter>) -> Self {
        Self { inner, counter }
    }

    pub fn counter(&self) -> &Arc<TrafficCounter> {
        &self.counter
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.counter.add_inbound((buf.filled().len() - before) as u64);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.counter.add_outbound(n as u64);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
