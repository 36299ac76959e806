//! Control channel liveness

use std::time::Duration;
use tokio::time::Instant;

/// Tracks when a control channel last heard from its peer. Any inbound
/// message counts, not only `Ping`/`Pong`.
pub(crate) struct Liveness {
    timeout: Duration,
    last_seen: Instant,
}

impl Liveness {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: Instant::now(),
        }
    }

    pub(crate) fn seen(&mut self) {
        self.last_seen = Instant::now();
    }

    /// The peer is considered gone once this instant passes without news
    pub(crate) fn deadline(&self) -> Instant {
        self.last_seen + self.timeout
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}
