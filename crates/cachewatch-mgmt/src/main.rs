use anyhow::Result;
use cachewatch_mgmt::cli::{Cli, Command};
use cachewatch_mgmt::config::{split_server_list, WatchConfig};
use cachewatch_mgmt::NodeInfoService;
use cachewatch_poller::StaticDirectory;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, servers } => serve(config, servers).await,
        Command::Nodes { server, cache } => Cli::nodes(&server, cache.as_deref()).await,
    }
}

async fn serve(config_path: PathBuf, servers: Option<String>) -> Result<()> {
    let mut config = WatchConfig::load_or_default(&config_path)?;
    if let Some(servers) = servers {
        config.servers = split_server_list(&servers).map(str::to_string).collect();
    }

    let addrs = config.parse_servers()?;
    if addrs.is_empty() {
        anyhow::bail!("no cache servers configured");
    }
    tracing::info!(servers = addrs.len(), "cachewatch starting");

    let directory = Arc::new(StaticDirectory::new(addrs));
    let service = Arc::new(NodeInfoService::new(Arc::new(config), directory));

    service
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
}
