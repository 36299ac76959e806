//! Per-session traffic reports

use burrow_control::{Broadcast, BusClosed};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Work-connection bytes moved by one relay session since the previous
/// report (wire bytes, after encryption and compression)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    pub session_id: String,
    pub inbound: u64,
    pub outbound: u64,
    /// Last report of the session
    pub finished: bool,
}

/// Subscribe a logging consumer to `bus`. The task ends when the bus closes.
pub fn spawn_traffic_logger(bus: &Broadcast<TrafficReport>) -> Result<JoinHandle<()>, BusClosed> {
    let mut subscription = bus.reg_with_capacity(256)?;
    Ok(tokio::spawn(async move {
        while let Some(report) = subscription.recv().await {
            if report.finished {
                debug!(
                    "Session {} closed (last interval: {} bytes in, {} bytes out)",
                    report.session_id, report.inbound, report.outbound
                );
            } else {
                trace!(
                    "Session {}: {} bytes in, {} bytes out",
                    report.session_id,
                    report.inbound,
                    report.outbound
                );
            }
        }
    }))
}
