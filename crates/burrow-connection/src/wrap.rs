//! Wrapper stack composition
//!
//! Layers, innermost first: traffic counter (wire bytes), cipher, compression.
//! The application writes plaintext into the compressor, which writes
//! compressed bytes into the cipher, which writes ciphertext onto the wire.
//! Each layer takes ownership of the one below it, so only the outermost
//! value can close the connection.

use crate::compress::CompressStream;
use crate::counter::{CountingStream, TrafficCounter};
use crate::crypto::{derive_key, CryptoError, CryptoStream};
use crate::pool::Pool;
use crate::stream::{BoxedConnection, Connection};
use burrow_proto::TransportOptions;
use std::sync::Arc;
use tracing::trace;

/// Apply the cipher and compression layers selected by `options`.
///
/// Cipher setup failures are returned before any byte is exchanged.
pub fn wrap_connection<S>(
    conn: S,
    options: &TransportOptions,
    pool: &Arc<Pool>,
) -> Result<BoxedConnection, CryptoError>
where
    S: Connection,
{
    let mut conn: BoxedConnection = Box::new(conn);

    if options.use_encryption {
        let key = derive_key(options.secret.as_bytes());
        conn = Box::new(CryptoStream::new(conn, &key)?);
    }
    if options.use_compression {
        conn = Box::new(CompressStream::new(conn, pool.clone()));
    }

    trace!(
        "Wrapped connection (encryption: {}, compression: {})",
        options.use_encryption,
        options.use_compression
    );
    Ok(conn)
}

/// Like [`wrap_connection`], with a traffic counter directly on the wire side
pub fn wrap_counted<S>(
    conn: S,
    counter: Arc<TrafficCounter>,
    options: &TransportOptions,
    pool: &Arc<Pool>,
) -> Result<BoxedConnection, CryptoError>
where
    S: Connection,
{
    wrap_connection(CountingStream::new(conn, counter), options, pool)
}
