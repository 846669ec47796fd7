use anyhow::Result;
use beach_pier::config::{Cli, ServerConfig};
use beach_pier::{server, telemetry::Telemetry};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "starting beach-pier"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
