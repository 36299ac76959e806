//! Server and agent configuration

use burrow_control::PoolConfig;
use burrow_proto::TransportOptions;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Tunnel server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control port agents connect to
    pub bind_addr: SocketAddr,

    /// Address the per-agent visitor listeners bind on
    pub proxy_bind_ip: IpAddr,

    /// Pre-shared secret for work-connection encryption
    pub secret: String,

    /// Work-connection pool policy, one pool per control channel
    pub pool: PoolConfig,

    /// Deadline for the first frame on a new connection
    #[serde(with = "burrow_proto::duration_secs")]
    pub handshake_timeout: Duration,

    /// A control channel silent for this long is closed
    #[serde(with = "burrow_proto::duration_secs")]
    pub heartbeat_timeout: Duration,

    /// How long a graceful stop waits for in-flight relays
    #[serde(with = "burrow_proto::duration_secs")]
    pub drain_timeout: Duration,

    /// Interval between traffic samples of a running relay
    #[serde(with = "burrow_proto::duration_secs")]
    pub report_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
            proxy_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secret: String::new(),
            pool: PoolConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(90),
            drain_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(10),
        }
    }
}

/// Tunnel agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server control address (e.g., "tunnel.example.com:7000")
    pub server_addr: String,

    /// Local service relayed to visitors (e.g., "127.0.0.1:22")
    pub local_addr: String,

    /// Public port the server exposes the service on
    pub remote_port: u16,

    /// Identifies this agent's control channel; generated when empty
    pub run_id: String,

    /// Encryption/compression flags and secret for work connections
    pub transport: TransportOptions,

    /// Spare work connections the server keeps ready
    pub pool_count: u32,

    #[serde(with = "burrow_proto::duration_secs")]
    pub heartbeat_interval: Duration,

    /// The control channel is treated as lost when the server stays silent
    /// for this long
    #[serde(with = "burrow_proto::duration_secs")]
    pub heartbeat_timeout: Duration,

    #[serde(with = "burrow_proto::duration_secs")]
    pub connect_timeout: Duration,

    #[serde(with = "burrow_proto::duration_secs")]
    pub drain_timeout: Duration,

    #[serde(with = "burrow_proto::duration_secs")]
    pub report_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            local_addr: "127.0.0.1:80".to_string(),
            remote_port: 0,
            run_id: String::new(),
            transport: TransportOptions::default(),
            pool_count: 1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(10),
        }
    }
}
