//! Burrow control plane
//!
//! Supplies work connections to the data plane (idle pool plus dial-back
//! over the control channel) and the coordination primitives the server and
//! agent use to tear relays down cleanly: a fan-out notifier, a two-phase
//! shutdown gate and a per-session relay task tracker.

pub mod broadcast;
pub mod shutdown;
pub mod task_tracker;
pub mod work_pool;

pub use broadcast::{Broadcast, BusClosed, Subscription};
pub use shutdown::ShutdownGate;
pub use task_tracker::TaskTracker;
pub use work_pool::{Arrival, PoolConfig, PoolError, WorkConnPool, WorkConnRequester};
