use anyhow::Result;
use cachewatch_poller::NodeInfo;
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::path::PathBuf;

/// Command line of the `cachewatch` binary.
#[derive(Parser)]
#[command(name = "cachewatch")]
#[command(about = "Per-node entry counts for a cache cluster", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `cachewatch` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the node info service.
    Serve {
        /// TOML or JSON config file; defaults apply if it is missing.
        #[arg(short, long, default_value = "/etc/cachewatch/cachewatch.toml")]
        config: PathBuf,
        /// `host:port;host:port` list, overrides `servers` from the config file.
        #[arg(short, long, env = "CACHEWATCH_SERVERS")]
        servers: Option<String>,
    },
    /// Print the node snapshot of a running service.
    Nodes {
        /// Base URL of the running service.
        #[arg(short, long, default_value = "http://localhost:8080")]
        server: String,
        /// Cache to list; the service's default cache if omitted.
        #[arg(short, long)]
        cache: Option<String>,
    },
}

impl Cli {
    /// Fetches a snapshot from `server` and prints it as a table.
    pub async fn nodes(server: &str, cache: Option<&str>) -> Result<()> {
        let url = nodes_url(server, cache);
        let response = Client::new().get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }

        let nodes: Vec<NodeInfo> = response.json().await?;
        print!("{}", format_nodes(&nodes));
        Ok(())
    }
}

/// URL of the snapshot endpoint for `cache`.
pub fn nodes_url(server: &str, cache: Option<&str>) -> String {
    let server = server.trim_end_matches('/');
    match cache {
        Some(cache) => format!("{}/api/v1/nodes/{}", server, cache),
        None => format!("{}/api/v1/nodes", server),
    }
}

/// Renders a snapshot as a fixed-width table.
pub fn format_nodes(nodes: &[NodeInfo]) -> String {
    let mut out = format!("{:<28} {:<28} {:>12}\n", "NODE", "ADDRESS", "ENTRIES");
    for node in nodes {
        let value = node
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<28} {:<28} {:>12}\n",
            node.id.as_str(),
            node.address.to_string(),
            value
        ));
    }
    out
}
