//! Burrow reverse tunnel
//!
//! A [`TunnelServer`] listens for agents on a public control port and exposes
//! each logged-in agent's service on a remote port. A [`TunnelAgent`] runs
//! next to the private service: it logs in, dials back work connections when
//! the server asks for them, and relays each one to the local service.
//!
//! ```ignore
//! use burrow_lib::{AgentConfig, ServerConfig, TunnelAgent, TunnelServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = TunnelServer::bind(ServerConfig::default()).await?;
//! let gate = server.gate();
//! tokio::spawn(server.run());
//!
//! let agent = TunnelAgent::new(AgentConfig {
//!     server_addr: "127.0.0.1:7000".to_string(),
//!     local_addr: "127.0.0.1:22".to_string(),
//!     remote_port: 6000,
//!     ..Default::default()
//! });
//! agent.run().await?;
//!
//! gate.start();
//! gate.wait_done().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
mod heartbeat;
mod relay;
pub mod server;
pub mod telemetry;

pub use agent::{AgentError, TunnelAgent};
pub use config::{AgentConfig, ServerConfig};
pub use server::{ServerError, ServerHandle, TunnelServer};
pub use telemetry::{spawn_traffic_logger, TrafficReport};

// Re-export the building blocks for embedders
pub use burrow_connection::{join, wrap_connection, wrap_counted, Pool, TrafficCounter};
pub use burrow_control::{Broadcast, PoolConfig, ShutdownGate};
pub use burrow_proto::TransportOptions;
