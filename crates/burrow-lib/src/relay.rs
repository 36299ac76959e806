//! Relay one session over a work connection

use crate::telemetry::TrafficReport;
use burrow_connection::{join, wrap_counted, Connection, CryptoError, Pool, TrafficCounter};
use burrow_control::Broadcast;
use burrow_proto::TransportOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Longest a relay waits for the traffic bus to take one report
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

/// Wrap `work` per `options` and join it with `local` until either side
/// closes, publishing a traffic sample every `report_interval` and once at
/// the end. Returns the plaintext totals `(local -> work, work -> local)`.
pub(crate) async fn relay_session<L, W>(
    session_id: &str,
    local: L,
    work: W,
    options: &TransportOptions,
    pool: &Arc<Pool>,
    traffic: &Broadcast<TrafficReport>,
    report_interval: Duration,
) -> Result<(u64, u64), CryptoError>
where
    L: Connection,
    W: Connection,
{
    let counter = Arc::new(TrafficCounter::new());
    let work = wrap_counted(work, counter.clone(), options, pool)?;

    let relay = join(local, work, pool);
    tokio::pin!(relay);

    let mut ticker = tokio::time::interval(report_interval.max(MIN_REPORT_INTERVAL));
    ticker.tick().await;

    let totals = loop {
        tokio::select! {
            totals = &mut relay => break totals,
            _ = ticker.tick() => {
                publish(traffic, report(session_id, &counter, false)).await;
            }
        }
    };
    publish(traffic, report(session_id, &counter, true)).await;

    debug!(
        "Session {} relayed {} bytes out, {} bytes back (wire: {} in, {} out)",
        session_id,
        totals.0,
        totals.1,
        counter.total_inbound(),
        counter.total_outbound()
    );
    Ok(totals)
}

/// A subscriber that stops reading must not keep the relay alive, so a
/// report that cannot be delivered in time is dropped.
async fn publish(traffic: &Broadcast<TrafficReport>, report: TrafficReport) {
    match tokio::time::timeout(PUBLISH_TIMEOUT, traffic.publish(report)).await {
        Ok(_) => {}
        Err(_) => debug!("Traffic bus busy, report dropped"),
    }
}

fn report(session_id: &str, counter: &TrafficCounter, finished: bool) -> TrafficReport {
    let sample = counter.sample();
    TrafficReport {
        session_id: session_id.to_string(),
        inbound: sample.inbound,
        outbound: sample.outbound,
        finished,
    }
}
