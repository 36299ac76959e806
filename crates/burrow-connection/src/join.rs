//! Duplex relay between two connections

use crate::pool::Pool;
use crate::stream::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Copy buffer size per direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on the closing half-shutdown of each write side
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pipe `a` and `b` together until either side closes.
///
/// Runs one copy task per direction. Whichever direction finishes first (EOF
/// or error) closes both connections, so a half-dead peer can never keep the
/// other direction blocked. Returns the bytes copied `(a -> b, b -> a)`;
/// transport errors only end the relay, they are not reported.
pub async fn join<A, B>(a: A, b: B, pool: &Arc<Pool>) -> (u64, u64)
where
    A: Connection,
    B: Connection,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let closing = CancellationToken::new();
    // Dropping the relay before it completes still closes both pipes
    let _abort_guard = closing.clone().drop_guard();

    let a_to_b = tokio::spawn(pipe(a_read, b_write, pool.clone(), closing.clone()));
    let b_to_a = tokio::spawn(pipe(b_read, a_write, pool.clone(), closing));

    let a_to_b = a_to_b.await.unwrap_or_else(|e| {
        warn!("Relay copy task failed: {}", e);
        0
    });
    let b_to_a = b_to_a.await.unwrap_or_else(|e| {
        warn!("Relay copy task failed: {}", e);
        0
    });

    debug!("Relay complete: {} bytes a->b, {} bytes b->a", a_to_b, b_to_a);
    (a_to_b, b_to_a)
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    pool: Arc<Pool>,
    closing: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire_buf(RELAY_BUFFER_SIZE);
    let mut total = 0u64;

    tokio::select! {
        result = copy(&mut reader, &mut writer, &mut buf, &mut total) => {
            if let Err(e) = result {
                debug!("Relay direction ended with error: {}", e);
            }
        }
        _ = closing.cancelled() => {}
    }

    // Close both ends: wake the other direction, then half-close our writer
    closing.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown())
        .await
        .is_err()
    {
        debug!("Relay write side did not shut down in time");
    }

    pool.release_buf(buf);
    total
}

async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    total: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}
