//! Transport connection abstraction

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional ordered byte stream with independent half-close.
///
/// Anything tokio can read from and write to qualifies: TCP streams,
/// in-memory duplex pipes, and every wrapper in this crate.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection, used where the wrapper stack is chosen at runtime
pub type BoxedConnection = Box<dyn Connection>;
