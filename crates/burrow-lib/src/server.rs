//! Reverse tunnel server
//!
//! Every connection to the control port starts with one frame that decides
//! its role. `Login` turns it into a control channel: the server binds the
//! agent's visitor listener and serves it until the agent leaves. `NewWorkConn`
//! marks a dialed-back work connection, which is handed to the matching
//! control channel's pool.

use crate::config::ServerConfig;
use crate::heartbeat::Liveness;
use crate::relay::relay_session;
use crate::telemetry::TrafficReport;
use burrow_connection::{PeekableConnection, Pool};
use burrow_control::{Broadcast, ShutdownGate, TaskTracker, WorkConnPool};
use burrow_proto::{
    read_message, write_message, CodecError, ControlMessage, TransportOptions, PROTOCOL_VERSION,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest a visitor's first bytes are sniffed while its work connection
/// is being fetched
const SNIFF_WINDOW: Duration = Duration::from_millis(200);

/// Extra time the server gives control channels beyond their own drain
const CONTROL_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// State shared by the accept loop and every control channel
struct Shared {
    config: ServerConfig,
    buffers: Arc<Pool>,
    gate: Arc<ShutdownGate>,
    channels: DashMap<String, Arc<ControlChannel>>,
    /// Control channel tasks, keyed by run id
    controls: Arc<TaskTracker>,
    traffic: Arc<Broadcast<TrafficReport>>,
}

/// One logged-in agent
struct ControlChannel {
    run_id: String,
    proxy_addr: SocketAddr,
    transport: TransportOptions,
    work_pool: WorkConnPool<TcpStream>,
    /// Visitor relays, keyed by session id
    relays: Arc<TaskTracker>,
}

/// Cloneable view of a running server
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn gate(&self) -> Arc<ShutdownGate> {
        self.shared.gate.clone()
    }

    pub fn traffic(&self) -> Arc<Broadcast<TrafficReport>> {
        self.shared.traffic.clone()
    }

    /// Visitor address exposed for a logged-in agent
    pub fn proxy_addr(&self, run_id: &str) -> Option<SocketAddr> {
        self.shared.channels.get(run_id).map(|c| c.proxy_addr)
    }

    /// Run ids of the agents currently logged in
    pub fn agents(&self) -> Vec<String> {
        self.shared
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Reverse tunnel server
pub struct TunnelServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TunnelServer {
    /// Bind the control port. Must be called from within a tokio runtime.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: config.bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        let shared = Arc::new(Shared {
            config,
            buffers: Arc::new(Pool::new()),
            gate: Arc::new(ShutdownGate::new()),
            channels: DashMap::new(),
            controls: Arc::new(TaskTracker::new()),
            traffic: Broadcast::new(),
        });

        Ok(Self { listener, shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn gate(&self) -> Arc<ShutdownGate> {
        self.shared.gate.clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept agents until the shutdown gate starts, then drain every
    /// control channel and fire `done`.
    pub async fn run(self) -> Result<(), ServerError> {
        let shared = self.shared;
        info!("Burrow server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shared.gate.wait_start() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, socket, peer_addr).await {
                                warn!("Failed to handle connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
        drop(self.listener);

        info!(
            "Shutting down, draining {} control channel(s)",
            shared.controls.len()
        );
        let deadline = shared.config.drain_timeout + CONTROL_CLOSE_GRACE;
        if tokio::time::timeout(deadline, shared.controls.wait_idle())
            .await
            .is_err()
        {
            warn!("Control channels did not close in time, aborting");
            shared.controls.abort_all();
        }

        shared.traffic.close();
        shared.gate.done();
        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), ServerError> {
    let _ = socket.set_nodelay(true);
    let first = tokio::time::timeout(shared.config.handshake_timeout, read_message(&mut socket))
        .await
        .map_err(|_| ServerError::Handshake("no handshake frame in time".to_string()))??;

    match first {
        ControlMessage::Login {
            version,
            run_id,
            remote_port,
            pool_count,
            use_encryption,
            use_compression,
        } => {
            if version != PROTOCOL_VERSION {
                let reason = format!(
                    "protocol version {} not supported (server speaks {})",
                    version, PROTOCOL_VERSION
                );
                warn!("Agent {} login rejected: {}", run_id, reason);
                return reject_login(&mut socket, run_id, &reason).await;
            }
            let transport = TransportOptions {
                use_encryption,
                use_compression,
                secret: shared.config.secret.clone(),
            };
            login(shared, socket, peer_addr, run_id, remote_port, pool_count, transport).await
        }
        ControlMessage::NewWorkConn { run_id, session_id } => {
            let channel = shared.channels.get(&run_id).map(|c| c.value().clone());
            match channel {
                Some(channel) => {
                    let arrival = channel.work_pool.on_work_conn_arrived(&session_id, socket);
                    debug!(
                        "Work connection from agent {} for session {:?}: {:?}",
                        run_id, session_id, arrival
                    );
                }
                None => warn!("Work connection for unknown agent {}", run_id),
            }
            Ok(())
        }
        other => Err(ServerError::Handshake(format!(
            "unexpected first message {}",
            other.kind()
        ))),
    }
}

async fn reject_login(
    socket: &mut TcpStream,
    run_id: String,
    reason: &str,
) -> Result<(), ServerError> {
    write_message(
        socket,
        &ControlMessage::LoginResp {
            run_id,
            error: Some(reason.to_string()),
        },
    )
    .await?;
    Ok(())
}

async fn login(
    shared: Arc<Shared>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    run_id: String,
    remote_port: u16,
    pool_count: u32,
    transport: TransportOptions,
) -> Result<(), ServerError> {
    if shared.gate.is_started() {
        return reject_login(&mut socket, run_id, "server is shutting down").await;
    }
    let run_id = if run_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        run_id
    };

    let bind_addr = SocketAddr::new(shared.config.proxy_bind_ip, remote_port);
    let visitors = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let reason = format!("cannot listen on port {}: {}", remote_port, e);
            warn!("Agent {} login rejected: {}", run_id, reason);
            return reject_login(&mut socket, run_id, &reason).await;
        }
    };
    let proxy_addr = visitors.local_addr()?;

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let channel = Arc::new(ControlChannel {
        run_id: run_id.clone(),
        proxy_addr,
        transport,
        work_pool: WorkConnPool::new(shared.config.pool.clone(), outbound_tx.clone()),
        relays: Arc::new(TaskTracker::new()),
    });

    let registered = match shared.channels.entry(run_id.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(entry) => {
            entry.insert(channel.clone());
            true
        }
    };
    if !registered {
        warn!("Agent {} is already logged in", run_id);
        return reject_login(&mut socket, run_id, "run id already in use").await;
    }

    let accepted = ControlMessage::LoginResp {
        run_id: run_id.clone(),
        error: None,
    };
    if let Err(e) = write_message(&mut socket, &accepted).await {
        shared.channels.remove(&run_id);
        return Err(e.into());
    }
    info!(
        "Agent {} logged in from {}, exposing {}",
        run_id, peer_addr, proxy_addr
    );

    let controls = shared.controls.clone();
    controls.spawn(
        run_id,
        serve_control(shared, channel, socket, visitors, outbound_tx, outbound_rx, pool_count),
    );
    Ok(())
}

async fn serve_control(
    shared: Arc<Shared>,
    channel: Arc<ControlChannel>,
    socket: TcpStream,
    visitors: TcpListener,
    outbound_tx: mpsc::Sender<ControlMessage>,
    mut outbound_rx: mpsc::Receiver<ControlMessage>,
    pool_count: u32,
) {
    let (reader, mut writer) = socket.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!("Control channel write failed: {}", e);
                break;
            }
        }
    });
    let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
    let reader_task = tokio::spawn(read_control(reader, inbound_tx));

    if let Err(e) = channel.work_pool.prefill(pool_count as usize).await {
        warn!("Failed to prefill work connections for {}: {}", channel.run_id, e);
    }

    let mut liveness = Liveness::new(shared.config.heartbeat_timeout);
    loop {
        tokio::select! {
            _ = shared.gate.wait_start() => break,
            _ = tokio::time::sleep_until(liveness.deadline()) => {
                warn!(
                    "No heartbeat from agent {} in {:?}, closing control channel",
                    channel.run_id,
                    liveness.timeout()
                );
                break;
            }
            msg = inbound_rx.recv() => match msg {
                Some(ControlMessage::Ping) => {
                    liveness.seen();
                    let _ = outbound_tx.send(ControlMessage::Pong).await;
                }
                Some(other) => {
                    liveness.seen();
                    debug!("Ignoring {} on control channel {}", other.kind(), channel.run_id);
                }
                None => {
                    info!("Agent {} disconnected", channel.run_id);
                    break;
                }
            },
            accepted = visitors.accept() => match accepted {
                Ok((visitor, visitor_addr)) => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    debug!("Visitor {} for agent {} (session {})", visitor_addr, channel.run_id, session_id);
                    let relays = channel.relays.clone();
                    relays.spawn(
                        session_id.clone(),
                        serve_visitor(shared.clone(), channel.clone(), visitor, session_id),
                    );
                }
                Err(e) => error!("Failed to accept visitor: {}", e),
            },
        }
    }

    // Stop taking visitors and dial-backs before waiting on relays
    drop(visitors);
    channel.work_pool.begin_drain();

    if shared.gate.is_started() {
        let drained =
            tokio::time::timeout(shared.config.drain_timeout, channel.relays.wait_idle()).await;
        if drained.is_err() {
            warn!(
                "{} relay(s) of agent {} still running, aborting",
                channel.relays.len(),
                channel.run_id
            );
        }
    }
    channel.relays.abort_all();
    channel.work_pool.close();

    reader_task.abort();
    writer_task.abort();
    shared.channels.remove(&channel.run_id);
    info!("Control channel {} closed", channel.run_id);
}

async fn read_control(mut reader: OwnedReadHalf, inbound: mpsc::Sender<ControlMessage>) {
    loop {
        match read_message(&mut reader).await {
            Ok(msg) => {
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Err(CodecError::ConnectionClosed) => break,
            Err(e) => {
                warn!("Control channel read failed: {}", e);
                break;
            }
        }
    }
}

async fn serve_visitor(
    shared: Arc<Shared>,
    channel: Arc<ControlChannel>,
    visitor: TcpStream,
    session_id: String,
) {
    let _ = visitor.set_nodelay(true);
    let mut visitor = PeekableConnection::new(visitor);

    // Sniffing only runs while the work connection is on its way; a ready
    // connection cuts it short
    let work = channel.work_pool.get(&session_id);
    tokio::pin!(work);
    let (sniffed, work) = tokio::select! {
        biased;
        work = &mut work => (None, work),
        sniffed = tokio::time::timeout(SNIFF_WINDOW, visitor.sniff()) => (Some(sniffed), work.await),
    };

    let mut work = match work {
        Ok(work) => work,
        Err(e) => {
            warn!("No work connection for session {}: {}", session_id, e);
            return;
        }
    };

    if let Some(Ok(Ok(protocol))) = sniffed {
        if visitor.buffered().is_empty() {
            // Visitor closed before sending anything; the work connection
            // was never started
            debug!("Visitor of session {} left early", session_id);
            channel.work_pool.put_back(work);
            return;
        }
        debug!("Session {} visitor protocol: {:?}", session_id, protocol);
    }

    let start = ControlMessage::StartWorkConn {
        session_id: session_id.clone(),
    };
    if let Err(e) = write_message(&mut work, &start).await {
        warn!("Failed to start work connection for session {}: {}", session_id, e);
        return;
    }

    if let Err(e) = relay_session(
        &session_id,
        visitor,
        work,
        &channel.transport,
        &shared.buffers,
        &shared.traffic,
        shared.config.report_interval,
    )
    .await
    {
        warn!("Session {} failed: {}", session_id, e);
    }
}
