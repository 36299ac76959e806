//! Reverse tunnel agent
//!
//! Runs next to the private service. It keeps one control channel to the
//! server and, whenever the server asks for a work connection, dials a new
//! connection back, announces it with `NewWorkConn`, waits for
//! `StartWorkConn`, and relays it to the local service.

use crate::config::AgentConfig;
use crate::heartbeat::Liveness;
use crate::relay::relay_session;
use crate::telemetry::TrafficReport;
use burrow_connection::{CryptoError, Pool};
use burrow_control::{Broadcast, ShutdownGate, TaskTracker};
use burrow_proto::{read_message, write_message, CodecError, ControlMessage, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Tunnel agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cipher setup failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Reverse tunnel agent
pub struct TunnelAgent {
    config: Arc<AgentConfig>,
    run_id: String,
    buffers: Arc<Pool>,
    gate: Arc<ShutdownGate>,
    /// Work connections, from dial-back until their relay ends
    relays: Arc<TaskTracker>,
    traffic: Arc<Broadcast<TrafficReport>>,
}

impl TunnelAgent {
    /// Create an agent. Must be called from within a tokio runtime.
    pub fn new(config: AgentConfig) -> Self {
        let run_id = if config.run_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.run_id.clone()
        };
        Self {
            config: Arc::new(config),
            run_id,
            buffers: Arc::new(Pool::new()),
            gate: Arc::new(ShutdownGate::new()),
            relays: Arc::new(TaskTracker::new()),
            traffic: Broadcast::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn gate(&self) -> Arc<ShutdownGate> {
        self.gate.clone()
    }

    pub fn traffic(&self) -> Arc<Broadcast<TrafficReport>> {
        self.traffic.clone()
    }

    /// Log in and serve the control channel.
    ///
    /// Returns `Ok` after a graceful stop (the gate's `done` has fired by
    /// then) and an error when the control channel is lost, so the caller
    /// can reconnect by calling `run` again.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut control = connect(&self.config.server_addr, self.config.connect_timeout).await?;

        let login = ControlMessage::Login {
            version: PROTOCOL_VERSION,
            run_id: self.run_id.clone(),
            remote_port: self.config.remote_port,
            pool_count: self.config.pool_count,
            use_encryption: self.config.transport.use_encryption,
            use_compression: self.config.transport.use_compression,
        };
        write_message(&mut control, &login).await?;

        let response = tokio::time::timeout(self.config.connect_timeout, read_message(&mut control))
            .await
            .map_err(|_| AgentError::Protocol("no login response".to_string()))??;
        match response {
            ControlMessage::LoginResp { error: Some(e), .. } => {
                return Err(AgentError::LoginRejected(e));
            }
            ControlMessage::LoginResp { error: None, .. } => {
                info!(
                    "Logged in to {} as {}, remote port {}",
                    self.config.server_addr, self.run_id, self.config.remote_port
                );
            }
            other => {
                return Err(AgentError::Protocol(format!(
                    "expected LoginResp, got {}",
                    other.kind()
                )));
            }
        }

        let (mut reader, mut writer) = control.into_split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(msg) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Control channel read ended: {}", e);
                        break;
                    }
                }
            }
        });

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        heartbeat.tick().await;

        let mut liveness = Liveness::new(self.config.heartbeat_timeout);
        let result = loop {
            tokio::select! {
                _ = self.gate.wait_start() => break Ok(()),
                _ = tokio::time::sleep_until(liveness.deadline()) => {
                    break Err(AgentError::ConnectionFailed(format!(
                        "no heartbeat from server in {:?}",
                        liveness.timeout()
                    )));
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write_message(&mut writer, &ControlMessage::Ping).await {
                        break Err(e.into());
                    }
                }
                msg = inbound_rx.recv() => match msg {
                    Some(ControlMessage::ReqWorkConn { session_id }) => {
                        liveness.seen();
                        if !self.gate.is_started() {
                            self.spawn_work_conn(session_id);
                        }
                    }
                    Some(ControlMessage::Pong) => {
                        liveness.seen();
                        trace!("Heartbeat acknowledged");
                    }
                    Some(other) => {
                        liveness.seen();
                        debug!("Ignoring {} on control channel", other.kind());
                    }
                    None => {
                        break Err(AgentError::ConnectionFailed(
                            "control channel closed by server".to_string(),
                        ))
                    }
                },
            }
        };
        reader_task.abort();

        if self.gate.is_started() {
            self.drain().await;
        } else {
            warn!("Lost control channel, closing {} relay(s)", self.relays.len());
            self.relays.abort_all();
        }
        result
    }

    fn spawn_work_conn(&self, session_id: String) {
        // Spares share the empty session id, so tasks get their own key
        let key = uuid::Uuid::new_v4().to_string();
        let config = self.config.clone();
        let run_id = self.run_id.clone();
        let buffers = self.buffers.clone();
        let gate = self.gate.clone();
        let traffic = self.traffic.clone();

        self.relays.spawn(key, async move {
            if let Err(e) =
                serve_work_conn(config, run_id, session_id, buffers, gate, traffic).await
            {
                warn!("Work connection failed: {}", e);
            }
        });
    }

    async fn drain(&self) {
        info!("Draining {} work connection(s)", self.relays.len());
        if tokio::time::timeout(self.config.drain_timeout, self.relays.wait_idle())
            .await
            .is_err()
        {
            warn!("Relays did not finish in time, aborting");
            self.relays.abort_all();
        }
        self.traffic.close();
        self.gate.done();
    }
}

async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, AgentError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| AgentError::ConnectionFailed(format!("{}: timed out", addr)))?
        .map_err(|e| AgentError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn serve_work_conn(
    config: Arc<AgentConfig>,
    run_id: String,
    session_id: String,
    buffers: Arc<Pool>,
    gate: Arc<ShutdownGate>,
    traffic: Arc<Broadcast<TrafficReport>>,
) -> Result<(), AgentError> {
    let mut work = connect(&config.server_addr, config.connect_timeout).await?;
    write_message(
        &mut work,
        &ControlMessage::NewWorkConn {
            run_id,
            session_id: session_id.clone(),
        },
    )
    .await?;
    debug!("Dialed back work connection for session {:?}", session_id);

    // Spare connections may sit here for a long time before a visitor comes
    let start = tokio::select! {
        msg = read_message(&mut work) => msg,
        _ = gate.wait_start() => return Ok(()),
    };
    let session_id = match start {
        Ok(ControlMessage::StartWorkConn { session_id }) => session_id,
        Ok(other) => {
            return Err(AgentError::Protocol(format!(
                "expected StartWorkConn, got {}",
                other.kind()
            )));
        }
        Err(CodecError::ConnectionClosed) => {
            debug!("Work connection closed before it was used");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let local = connect(&config.local_addr, config.connect_timeout).await?;
    relay_session(
        &session_id,
        local,
        work,
        &config.transport,
        &buffers,
        &traffic,
        config.report_interval,
    )
    .await?;
    Ok(())
}
