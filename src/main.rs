//! Burrow CLI - Reverse tunnel server and agent
//!
//! Expose a service behind NAT through a public server. Ctrl+C stops
//! accepting new visitors and lets in-flight relays drain before exiting.

use anyhow::{Context, Result};
use burrow_lib::{
    spawn_traffic_logger, AgentConfig, ServerConfig, TransportOptions, TunnelAgent, TunnelServer,
};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Extra time given to the drain before the process exits anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BURROW_GIT_HASH"),
    ", built ",
    env!("BURROW_BUILD_TIME"),
    ")"
);

/// Burrow - Expose private services through a public tunnel server
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - Expose private services through a public tunnel server")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public tunnel server
    #[command(long_about = r#"
Run the public side of the tunnel. Agents log in on the control port and
each one gets a visitor port relayed back to its private service.

EXAMPLES:
  burrow server --bind 0.0.0.0:7000 --secret "$BURROW_SECRET"

ENVIRONMENT VARIABLES:
  BURROW_BIND           Control listen address
  BURROW_SECRET         Pre-shared secret for encrypted tunnels
  BURROW_PROXY_BIND_IP  Address visitor ports bind on
    "#)]
    Server {
        /// Control listen address
        #[arg(long, env = "BURROW_BIND", default_value = "0.0.0.0:7000")]
        bind: SocketAddr,

        /// Pre-shared secret for encrypted tunnels
        #[arg(long, env = "BURROW_SECRET", default_value = "")]
        secret: String,

        /// Address visitor ports bind on
        #[arg(long, env = "BURROW_PROXY_BIND_IP", default_value = "0.0.0.0")]
        proxy_bind_ip: IpAddr,

        /// Spare work connections kept idle per agent
        #[arg(long, default_value = "5")]
        max_idle: usize,

        /// Seconds a graceful stop waits for in-flight relays
        #[arg(long, default_value = "30")]
        drain_timeout: u64,
    },

    /// Run the agent next to a private service
    #[command(long_about = r#"
Connect to a tunnel server and expose a local service on one of its ports.
Automatically reconnects if the control channel drops.

EXAMPLES:
  # Expose local SSH on port 6000 of the server
  burrow agent --server tunnel.example.com:7000 \
    --local 127.0.0.1:22 \
    --remote-port 6000

  # Encrypted and compressed
  burrow agent --server tunnel.example.com:7000 \
    --local 127.0.0.1:5432 --remote-port 6432 \
    --secret "$BURROW_SECRET" --encrypt --compress

ENVIRONMENT VARIABLES:
  BURROW_SERVER       Server control address
  BURROW_LOCAL        Local service address
  BURROW_REMOTE_PORT  Port exposed on the server
  BURROW_SECRET       Pre-shared secret
  BURROW_RUN_ID       Agent identifier
    "#)]
    Agent {
        /// Server control address (e.g., tunnel.example.com:7000)
        #[arg(long, env = "BURROW_SERVER")]
        server: String,

        /// Local service address (e.g., 127.0.0.1:22)
        #[arg(long, env = "BURROW_LOCAL")]
        local: String,

        /// Port exposed on the server (0 = any free port)
        #[arg(long, env = "BURROW_REMOTE_PORT", default_value = "0")]
        remote_port: u16,

        /// Pre-shared secret, must match the server's
        #[arg(long, env = "BURROW_SECRET", default_value = "")]
        secret: String,

        /// Encrypt work connections
        #[arg(long)]
        encrypt: bool,

        /// Compress work connections
        #[arg(long)]
        compress: bool,

        /// Spare work connections the server keeps ready
        #[arg(long, default_value = "1")]
        pool_count: u32,

        /// Agent identifier (auto-generated if not specified)
        #[arg(long, env = "BURROW_RUN_ID")]
        run_id: Option<String>,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let drain_timeout = config.drain_timeout;
    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start server")?;
    info!("Control port listening on {}", server.local_addr()?);

    let gate = server.gate();
    let traffic = server.handle().traffic();
    let _logger = spawn_traffic_logger(&traffic)?;

    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, draining...");
            gate.start();
        }
        result = &mut server_task => {
            return result.context("Server task panicked")?.map_err(Into::into);
        }
    }

    match tokio::time::timeout(drain_timeout + SHUTDOWN_GRACE, server_task).await {
        Ok(result) => result.context("Server task panicked")??,
        Err(_) => warn!("Server did not stop in time"),
    }
    info!("Burrow server stopped");
    Ok(())
}

/// Run the agent, reconnecting with exponential backoff when the control
/// channel is lost. Returns once a graceful stop completes.
async fn run_with_reconnect(
    agent: &TunnelAgent,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let gate = agent.gate();
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        match agent.run().await {
            Ok(()) => {
                info!("Agent stopped normally");
                return Ok(());
            }
            Err(e) => {
                error!("Agent error: {}", e);

                if max_attempts > 0 && attempt >= max_attempts {
                    return Err(e.into());
                }

                warn!(
                    "Reconnecting in {} seconds... (attempt {})",
                    current_delay.as_secs(),
                    attempt + 1
                );

                tokio::select! {
                    _ = tokio::time::sleep(current_delay) => {}
                    _ = gate.wait_start() => {
                        gate.done();
                        return Ok(());
                    }
                }

                current_delay = std::cmp::min(current_delay * 2, max_delay);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            bind,
            secret,
            proxy_bind_ip,
            max_idle,
            drain_timeout,
        } => {
            info!("Burrow server starting...");

            let mut config = ServerConfig {
                bind_addr: bind,
                proxy_bind_ip,
                secret,
                drain_timeout: Duration::from_secs(drain_timeout),
                ..Default::default()
            };
            config.pool.max_idle = max_idle;
            if config.secret.is_empty() {
                warn!("No secret configured, encrypted tunnels will use an empty key");
            }

            run_server(config).await
        }
        Commands::Agent {
            server,
            local,
            remote_port,
            secret,
            encrypt,
            compress,
            pool_count,
            run_id,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!("Burrow agent starting...");

            let config = AgentConfig {
                server_addr: server.clone(),
                local_addr: local.clone(),
                remote_port,
                run_id: run_id.unwrap_or_default(),
                transport: TransportOptions::new(secret)
                    .with_encryption(encrypt)
                    .with_compression(compress),
                pool_count,
                ..Default::default()
            };
            let drain_timeout = config.drain_timeout;

            let agent = TunnelAgent::new(config);
            info!("Run ID: {}", agent.run_id());
            info!("Server: {}", server);
            info!("Local service: {}", local);
            if encrypt {
                info!("Encryption enabled");
            }
            if compress {
                info!("Compression enabled");
            }

            let gate = agent.gate();
            let _logger = spawn_traffic_logger(&agent.traffic())?;

            let agent_task = run_with_reconnect(
                &agent,
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            );
            tokio::pin!(agent_task);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, draining...");
                    gate.start();
                }
                result = &mut agent_task => return result,
            }

            match tokio::time::timeout(drain_timeout + SHUTDOWN_GRACE, &mut agent_task).await {
                Ok(result) => result?,
                Err(_) => warn!("Agent did not stop in time"),
            }
            info!("Burrow agent stopped");
            Ok(())
        }
    }
}
