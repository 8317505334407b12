use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use sandbox_fleet::api::{ApiServer, ApiServerConfig};
use sandbox_fleet::cli::{Cli, Command, init_logging, render_config};
use sandbox_fleet::engine::{ContainerEngine, DockerEngine};
use sandbox_fleet::{FleetConfig, SandboxManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_json = matches!(cli.command, Command::Serve { log_json: true, .. });
    init_logging(log_json);

    let config = FleetConfig::load(cli.command.config_path().map(|p| p.as_path()))
        .context("failed to load configuration")?;

    match cli.command {
        Command::CheckConfig { .. } => {
            println!("{}", render_config(&config)?);
        }
        Command::FactoryReset { .. } => {
            let manager = build_manager(config).await?;
            let report = manager.factory_reset().await?;
            println!(
                "Removed {} containers, dropped {} records, released {} ports",
                report.containers_removed, report.records_dropped, report.ports_released
            );
        }
        Command::Serve { bind, .. } => {
            let manager = Arc::new(build_manager(config).await?);
            let mut server = ApiServer::new(ApiServerConfig { addr: bind }, manager);
            server.start().await?;

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");

            server.shutdown().await;
        }
    }

    Ok(())
}

async fn build_manager(config: FleetConfig) -> anyhow::Result<SandboxManager> {
    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect()
            .await
            .context("failed to connect to Docker")?,
    );
    Ok(SandboxManager::with_http_probe(config, engine)?)
}
