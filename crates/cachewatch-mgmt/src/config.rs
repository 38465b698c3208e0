use cachewatch_poller::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Service configuration, loaded from TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Address the REST API listens on.
    pub bind_addr: SocketAddr,
    /// Cluster members as `host:port`, each entry possibly a `;` list.
    pub servers: Vec<String>,
    /// Cache served by `/api/v1/nodes`.
    pub default_cache: String,
    /// Poll and reconciliation interval.
    pub refresh_rate_ms: u64,
    /// Port of each node's metrics endpoint; the node's own port if unset.
    pub metrics_port: Option<u16>,
    /// Path of each node's metrics endpoint.
    pub metrics_path: String,
    /// Metric holding a cache's entry count.
    pub entries_metric: String,
    /// Per-request timeout of a scrape.
    pub scrape_timeout_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            servers: Vec::new(),
            default_cache: String::from("default(dist_sync)"),
            refresh_rate_ms: 2000,
            metrics_port: None,
            metrics_path: String::from("/metrics"),
            entries_metric: String::from("cache_entries"),
            scrape_timeout_secs: 5,
        }
    }
}

impl WatchConfig {
    /// Loads `path`, choosing the format by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: WatchConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: WatchConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Loads `path`, or the defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    /// Parses `servers`. Each entry may itself be a `;`-separated list.
    pub fn parse_servers(&self) -> anyhow::Result<HashSet<Address>> {
        let mut out = HashSet::new();
        for entry in &self.servers {
            for part in split_server_list(entry) {
                let addr: Address = part
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid server '{}': {}", part, e))?;
                out.insert(addr);
            }
        }
        Ok(out)
    }

    /// `refresh_rate_ms` as a duration.
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }

    /// `scrape_timeout_secs` as a duration.
    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }
}

/// Splits a cache-client server list (`host1:port;host2:port`).
pub fn split_server_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(';').map(str::trim).filter(|s| !s.is_empty())
}
