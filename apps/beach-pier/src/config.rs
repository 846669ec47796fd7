use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

use crate::error::PierError;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_interval: crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Beach room relay between devices and their control UIs"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Seconds between heartbeat probes. A peer missing two probes is dropped.
    #[arg(
        long,
        env = "BEACH_PIER_HEARTBEAT_INTERVAL_SECS",
        default_value_t = 30
    )]
    heartbeat_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.heartbeat_interval_secs == 0 {
            return Err(PierError::InvalidConfig(
                "heartbeat interval must be greater than zero".into(),
            )
            .into());
        }
        Ok(ServerConfig {
            listen_addr,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
