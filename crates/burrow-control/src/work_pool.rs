//! Work-connection pool and dial-back
//!
//! Each control channel owns one [`WorkConnPool`]. A relay asks it for a work
//! connection with [`WorkConnPool::get`]: an idle connection is handed out
//! right away, otherwise the pool registers a waiter for the session, asks the
//! peer to dial back through the [`WorkConnRequester`], and waits (bounded)
//! for the matching connection to arrive via
//! [`WorkConnPool::on_work_conn_arrived`].
//!
//! Idle connections and waiters live under one lock, so an arriving
//! connection is claimed by exactly one waiter or lands in the idle pool,
//! never both.

use async_trait::async_trait;
use burrow_proto::ControlMessage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work-connection pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Dial-back request failed: {0}")]
    Request(String),

    #[error("Dial-back for session {session_id} timed out after {attempts} attempt(s)")]
    Timeout { session_id: String, attempts: u32 },

    #[error("Work connection pool closed")]
    Closed,

    #[error("Shutting down, no new dial-back requests")]
    ShuttingDown,
}

/// Pool sizing and dial-back policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle work connections kept for reuse
    pub max_idle: usize,

    /// Idle connections older than this are discarded on lookup
    #[serde(with = "burrow_proto::duration_secs")]
    pub idle_timeout: Duration,

    /// How long a single dial-back attempt waits for the peer
    #[serde(with = "burrow_proto::duration_secs")]
    pub dial_timeout: Duration,

    /// Extra dial-back attempts after a timeout (0 = single attempt)
    pub dial_retries: u32,

    /// Whether connections may go back to the idle pool after a relay
    pub reuse: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 5,
            idle_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            dial_retries: 0,
            reuse: false,
        }
    }
}

/// Sends dial-back requests to the peer of a control channel
#[async_trait]
pub trait WorkConnRequester: Send + Sync {
    /// Ask the peer to open a work connection tagged with `session_id`.
    /// An empty id asks for a spare connection.
    async fn request_work_conn(&self, session_id: &str) -> Result<(), PoolError>;
}

/// Queue `ReqWorkConn` on the control channel's outbound message queue
#[async_trait]
impl WorkConnRequester for mpsc::Sender<ControlMessage> {
    async fn request_work_conn(&self, session_id: &str) -> Result<(), PoolError> {
        self.send(ControlMessage::ReqWorkConn {
            session_id: session_id.to_string(),
        })
        .await
        .map_err(|_| PoolError::Request("control channel closed".to_string()))
    }
}

/// What happened to an arriving or returned work connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Handed to a waiting relay
    Delivered,
    /// Kept in the idle pool
    Pooled,
    /// Dropped (pool full, closed, or reuse disabled)
    Rejected,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    /// session id -> waiters, oldest first
    waiters: HashMap<String, VecDeque<oneshot::Sender<C>>>,
    closed: bool,
}

pub struct WorkConnPool<C> {
    config: PoolConfig,
    requester: Box<dyn WorkConnRequester>,
    state: Mutex<PoolState<C>>,
    /// Spares requested by `prefill`; each one served or expired is replaced
    spares: AtomicUsize,
    closing: CancellationToken,
    draining: CancellationToken,
}

impl<C: Send + 'static> WorkConnPool<C> {
    pub fn new(config: PoolConfig, requester: impl WorkConnRequester + 'static) -> Self {
        Self {
            config,
            requester: Box::new(requester),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: HashMap::new(),
                closed: false,
            }),
            spares: AtomicUsize::new(0),
            closing: CancellationToken::new(),
            draining: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a work connection for `session_id`.
    ///
    /// Serves a fresh idle connection if one exists; otherwise requests a
    /// dial-back and waits up to `dial_timeout` per attempt, for
    /// `1 + dial_retries` attempts. Closing the pool unblocks the wait with
    /// [`PoolError::Closed`].
    pub async fn get(&self, session_id: &str) -> Result<C, PoolError> {
        let (idle, expired) = self.take_idle()?;
        let used = usize::from(idle.is_some());
        self.replenish(used + expired).await;

        if let Some(conn) = idle {
            debug!("Work connection for session {} served from idle pool", session_id);
            return Ok(conn);
        }
        if self.draining.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let attempts = self.config.dial_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let rx = self.add_waiter(session_id)?;

            if let Err(e) = self.requester.request_work_conn(session_id).await {
                drop(rx);
                self.prune_waiters(session_id);
                return Err(e);
            }
            debug!(
                "Dial-back requested for session {} (attempt {}/{})",
                session_id, attempt, attempts
            );

            let outcome = tokio::select! {
                result = tokio::time::timeout(self.config.dial_timeout, rx) => result,
                _ = self.closing.cancelled() => return Err(PoolError::Closed),
            };
            match outcome {
                Ok(Ok(conn)) => {
                    debug!("Dial-back fulfilled for session {}", session_id);
                    return Ok(conn);
                }
                // Sender dropped: the pool was closed under us
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    self.prune_waiters(session_id);
                    debug!("Dial-back for session {} timed out", session_id);
                }
            }

            if self.draining.is_cancelled() {
                return Err(PoolError::ShuttingDown);
            }
        }

        warn!(
            "No work connection for session {} after {} attempt(s)",
            session_id, attempts
        );
        Err(PoolError::Timeout {
            session_id: session_id.to_string(),
            attempts,
        })
    }

    /// Match a freshly dialed-back connection against pending waiters.
    ///
    /// A connection tagged with a session id goes to that session's oldest
    /// live waiter; an untagged spare goes to any waiter. Without a waiter it
    /// is pooled if there is room, otherwise dropped.
    pub fn on_work_conn_arrived(&self, session_id: &str, conn: C) -> Arrival {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Arrival::Rejected,
        };
        if state.closed {
            debug!("Pool closed, dropping work connection for session {:?}", session_id);
            return Arrival::Rejected;
        }

        let conn = if session_id.is_empty() {
            let keys: Vec<String> = state.waiters.keys().cloned().collect();
            let mut conn = conn;
            for key in keys {
                match deliver(&mut state.waiters, &key, conn) {
                    Ok(()) => return Arrival::Delivered,
                    Err(back) => conn = back,
                }
            }
            conn
        } else {
            match deliver(&mut state.waiters, session_id, conn) {
                Ok(()) => return Arrival::Delivered,
                Err(back) => back,
            }
        };

        self.pool_locked(&mut state, conn)
    }

    /// Offer a connection back after its relay finished. Only kept when
    /// `reuse` is enabled and the pool has room.
    pub fn put_back(&self, conn: C) -> Arrival {
        if !self.config.reuse {
            return Arrival::Rejected;
        }
        match self.state.lock() {
            Ok(mut state) if !state.closed => self.pool_locked(&mut state, conn),
            _ => Arrival::Rejected,
        }
    }

    /// Ask the peer for `count` spare connections for the idle pool. From then
    /// on every spare taken by `get` or discarded as expired is requested
    /// again, so about `count` stay ready.
    pub async fn prefill(&self, count: usize) -> Result<(), PoolError> {
        self.spares.store(count, Ordering::Relaxed);
        for _ in 0..count {
            if self.closing.is_cancelled() {
                return Err(PoolError::Closed);
            }
            self.requester.request_work_conn("").await?;
        }
        if count > 0 {
            debug!("Requested {} spare work connection(s)", count);
        }
        Ok(())
    }

    /// Stop issuing dial-back requests. Idle connections are still served.
    pub fn begin_drain(&self) {
        self.draining.cancel();
    }

    /// Close the pool: fail every waiter, drop idle connections, and reject
    /// later arrivals. Idempotent.
    pub fn close(&self) {
        self.closing.cancel();
        self.draining.cancel();
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = state.idle.len();
            state.idle.clear();
            state.waiters.clear();
            debug!("Work connection pool closed ({} idle dropped)", idle);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().map(|s| s.idle.len()).unwrap_or(0)
    }

    /// Number of waiters still blocked on a dial-back
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.waiters.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Pop the first fresh idle connection, with the number of expired ones
    /// discarded on the way
    fn take_idle(&self) -> Result<(Option<C>, usize), PoolError> {
        let mut state = self.state.lock().map_err(|_| PoolError::Closed)?;
        if state.closed {
            return Err(PoolError::Closed);
        }
        let mut expired = 0;
        while let Some(idle) = state.idle.pop_front() {
            if idle.since.elapsed() <= self.config.idle_timeout {
                return Ok((Some(idle.conn), expired));
            }
            debug!("Discarding expired idle work connection");
            expired += 1;
        }
        Ok((None, expired))
    }

    /// Request up to `count` replacement spares
    async fn replenish(&self, count: usize) {
        let count = count.min(self.spares.load(Ordering::Relaxed));
        if count == 0 || self.draining.is_cancelled() {
            return;
        }
        for _ in 0..count {
            if let Err(e) = self.requester.request_work_conn("").await {
                debug!("Failed to request replacement spare: {}", e);
                return;
            }
        }
        debug!("Requested {} replacement spare(s)", count);
    }

    fn add_waiter(&self, session_id: &str) -> Result<oneshot::Receiver<C>, PoolError> {
        let mut state = self.state.lock().map_err(|_| PoolError::Closed)?;
        if state.closed {
            return Err(PoolError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        state
            .waiters
            .entry(session_id.to_string())
            .or_default()
            .push_back(tx);
        Ok(rx)
    }

    /// Drop waiters whose receivers are gone
    fn prune_waiters(&self, session_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(queue) = state.waiters.get_mut(session_id) {
                queue.retain(|tx| !tx.is_closed());
                if queue.is_empty() {
                    state.waiters.remove(session_id);
                }
            }
        }
    }

    fn pool_locked(&self, state: &mut PoolState<C>, conn: C) -> Arrival {
        if state.idle.len() >= self.config.max_idle {
            debug!("Idle pool full ({}), dropping work connection", state.idle.len());
            return Arrival::Rejected;
        }
        state.idle.push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
        Arrival::Pooled
    }
}

/// Hand `conn` to the oldest live waiter for `key`, or give it back
fn deliver<C>(
    waiters: &mut HashMap<String, VecDeque<oneshot::Sender<C>>>,
    key: &str,
    mut conn: C,
) -> Result<(), C> {
    let Some(queue) = waiters.get_mut(key) else {
        return Err(conn);
    };
    let outcome = loop {
        match queue.pop_front() {
            Some(tx) => match tx.send(conn) {
                Ok(()) => break Ok(()),
                // Waiter gave up (timeout or cancelled); try the next one
                Err(back) => conn = back,
            },
            None => break Err(conn),
        }
    };
    if queue.is_empty() {
        waiters.remove(key);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CountingRequester {
        requests: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkConnRequester for CountingRequester {
        async fn request_work_conn(&self, session_id: &str) -> Result<(), PoolError> {
            self.requests.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    struct FailingRequester;

    #[async_trait]
    impl WorkConnRequester for FailingRequester {
        async fn request_work_conn(&self, _session_id: &str) -> Result<(), PoolError> {
            Err(PoolError::Request("control channel closed".to_string()))
        }
    }

    fn pool_with_log(config: PoolConfig) -> (Arc<WorkConnPool<u32>>, Arc<Mutex<Vec<String>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requester = CountingRequester {
            requests: requests.clone(),
        };
        (Arc::new(WorkConnPool::new(config, requester)), requests)
    }

    async fn wait_for_waiters(pool: &WorkConnPool<u32>, n: usize) {
        while pool.pending_count() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_idle_connection_served_first() {
        let (pool, requests) = pool_with_log(PoolConfig::default());

        assert_eq!(pool.on_work_conn_arrived("", 7), Arrival::Pooled);
        assert_eq!(pool.get("s1").await.unwrap(), 7);
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dial_back_fulfilled() {
        let (pool, requests) = pool_with_log(PoolConfig::default());

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get("s1").await }
        });
        wait_for_waiters(&pool, 1).await;

        assert_eq!(requests.lock().unwrap().as_slice(), ["s1".to_string()]);
        assert_eq!(pool.on_work_conn_arrived("s1", 42), Arrival::Delivered);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_arrival_never_double_delivered() {
        let (pool, _requests) = pool_with_log(PoolConfig::default());

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get("s1").await }
        });
        wait_for_waiters(&pool, 1).await;

        assert_eq!(pool.on_work_conn_arrived("s1", 1), Arrival::Delivered);
        assert_eq!(pool.on_work_conn_arrived("s1", 2), Arrival::Pooled);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_arrival_matches_its_session() {
        let (pool, _requests) = pool_with_log(PoolConfig::default());

        let a = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get("a").await }
        });
        wait_for_waiters(&pool, 1).await;
        let b = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get("b").await }
        });
        wait_for_waiters(&pool, 2).await;

        assert_eq!(pool.on_work_conn_arrived("b", 20), Arrival::Delivered);
        assert_eq!(pool.on_work_conn_arrived("a", 10), Arrival::Delivered);
        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_back_timeout() {
        let config = PoolConfig {
            dial_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let (pool, requests) = pool_with_log(config);

        let err = pool.get("s1").await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { attempts: 1, .. }));
        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(pool.pending_count(), 0);

        // A late arrival for the abandoned session is pooled, not lost
        assert_eq!(pool.on_work_conn_arrived("s1", 5), Arrival::Pooled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_back_retries() {
        let config = PoolConfig {
            dial_timeout: Duration::from_secs(1),
            dial_retries: 2,
            ..Default::default()
        };
        let (pool, requests) = pool_with_log(config);

        let err = pool.get("s1").await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { attempts: 3, .. }));
        assert_eq!(requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_close_unblocks_waiter() {
        let (pool, _requests) = pool_with_log(PoolConfig::default());

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get("s1").await }
        });
        wait_for_waiters(&pool, 1).await;

        pool.close();
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert_eq!(pool.on_work_conn_arrived("s1", 1), Arrival::Rejected);
        assert!(matches!(pool.get("s2").await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_request_failure_is_reported() {
        let pool: WorkConnPool<u32> = WorkConnPool::new(PoolConfig::default(), FailingRequester);

        assert!(matches!(pool.get("s1").await, Err(PoolError::Request(_))));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_stops_dial_back_but_serves_idle() {
        let (pool, requests) = pool_with_log(PoolConfig::default());
        pool.on_work_conn_arrived("", 3);
        pool.begin_drain();

        assert_eq!(pool.get("s1").await.unwrap(), 3);
        assert!(matches!(pool.get("s2").await, Err(PoolError::ShuttingDown)));
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_pool_bounded() {
        let config = PoolConfig {
            max_idle: 2,
            ..Default::default()
        };
        let (pool, _requests) = pool_with_log(config);

        assert_eq!(pool.on_work_conn_arrived("", 1), Arrival::Pooled);
        assert_eq!(pool.on_work_conn_arrived("", 2), Arrival::Pooled);
        assert_eq!(pool.on_work_conn_arrived("", 3), Arrival::Rejected);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_connection_discarded() {
        let config = PoolConfig {
            idle_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (pool, requests) = pool_with_log(config);

        pool.on_work_conn_arrived("", 1);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(matches!(pool.get("s1").await, Err(PoolError::Timeout { .. })));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_back_respects_reuse() {
        let (pool, _requests) = pool_with_log(PoolConfig::default());
        assert_eq!(pool.put_back(1), Arrival::Rejected);

        let config = PoolConfig {
            reuse: true,
            ..Default::default()
        };
        let (pool, _requests) = pool_with_log(config);
        assert_eq!(pool.put_back(1), Arrival::Pooled);
        assert_eq!(pool.get("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prefill_requests_spares() {
        let (pool, requests) = pool_with_log(PoolConfig::default());
        pool.prefill(3).await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(String::is_empty));
    }

    #[tokio::test]
    async fn test_used_spare_is_replaced() {
        let (pool, requests) = pool_with_log(PoolConfig::default());
        pool.prefill(2).await.unwrap();
        pool.on_work_conn_arrived("", 1);
        pool.on_work_conn_arrived("", 2);

        assert_eq!(pool.get("s1").await.unwrap(), 1);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(String::is_empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_spares_are_replaced() {
        let config = PoolConfig {
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (pool, requests) = pool_with_log(config);
        pool.prefill(2).await.unwrap();
        pool.on_work_conn_arrived("", 1);
        pool.on_work_conn_arrived("", 2);
        tokio::time::advance(Duration::from_secs(6)).await;
        pool.on_work_conn_arrived("", 3);

        // Both stale spares are dropped and asked for again
        assert_eq!(pool.get("s1").await.unwrap(), 3);
        assert_eq!(requests.lock().unwrap().len(), 2 + 2);
    }

    #[tokio::test]
    async fn test_no_replacement_without_prefill_or_while_draining() {
        let (pool, requests) = pool_with_log(PoolConfig::default());
        pool.on_work_conn_arrived("", 1);
        assert_eq!(pool.get("s1").await.unwrap(), 1);
        assert!(requests.lock().unwrap().is_empty());

        let (pool, requests) = pool_with_log(PoolConfig::default());
        pool.prefill(1).await.unwrap();
        pool.on_work_conn_arrived("", 1);
        pool.begin_drain();
        assert_eq!(pool.get("s1").await.unwrap(), 1);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spare_satisfies_any_waiter() {
        let (pool, _requests) = pool_with_log(PoolConfig::default());
        let delivered = Arc::new(AtomicUsize::new(0));

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let delivered = delivered.clone();
            async move {
                let conn = pool.get("s9").await;
                delivered.fetch_add(1, Ordering::SeqCst);
                conn
            }
        });
        wait_for_waiters(&pool, 1).await;

        assert_eq!(pool.on_work_conn_arrived("", 77), Arrival::Delivered);
        assert_eq!(waiter.await.unwrap().unwrap(), 77);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mpsc_requester_sends_req_work_conn() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.request_work_conn("s1").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ControlMessage::ReqWorkConn {
                session_id: "s1".to_string()
            })
        );

        drop(rx);
        assert!(matches!(
            tx.request_work_conn("s2").await,
            Err(PoolError::Request(_))
        ));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: PoolConfig = serde_json::from_str(r#"{"dial_timeout": 3}"#).unwrap();
        assert_eq!(config.max_idle, 5);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.dial_retries, 0);
        assert!(!config.reuse);
    }
}
