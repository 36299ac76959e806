//! Data-plane connection layer
//!
//! Wrappers that decorate a relayed byte stream (traffic counting,
//! encryption, compression, peeking), the shared buffer/codec pool they draw
//! from, and `join`, the duplex relay that pipes two connections together.

pub mod compress;
pub mod counter;
pub mod crypto;
pub mod join;
pub mod peek;
pub mod pool;
pub mod stream;
pub mod wrap;

pub use compress::CompressStream;
pub use counter::{CountingStream, TrafficCounter, TrafficSample};
pub use crypto::{derive_key, CryptoError, CryptoStream};
pub use join::join;
pub use peek::{PeekState, PeekableConnection, Protocol, TeeReader};
pub use pool::Pool;
pub use stream::{BoxedConnection, Connection};
pub use wrap::{wrap_connection, wrap_counted};
