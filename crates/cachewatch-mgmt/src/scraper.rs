use async_trait::async_trait;
use cachewatch_poller::{
    Address, MetricFetcher, MetricValue, NodeInfo, PollerError, PollingWorker, WorkerFactory,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One sample of a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Metric name.
    pub name: String,
    /// Label set.
    pub labels: HashMap<String, String>,
    /// Sample value.
    pub value: f64,
}

/// Parses Prometheus text exposition into samples. Comments, blank lines
/// and unparsable lines are skipped; timestamps after the value are ignored.
pub fn parse_prometheus_text(text: &str) -> Vec<Sample> {
    let mut result = Vec::new();

    for line in text.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, label_body, rest)) = split_series(line) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let value = match rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) {
            Some(value) => value,
            None => continue,
        };

        let labels = label_body.map(parse_labels).unwrap_or_default();

        result.push(Sample {
            name: name.to_string(),
            labels,
            value,
        });
    }

    result
}

/// Splits `name{labels} rest` into its parts. The closing brace is the
/// first `}` outside a quoted label value; `None` if there is none.
fn split_series(line: &str) -> Option<(&str, Option<&str>, &str)> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];
    if !line[name_end..].starts_with('{') {
        return Some((name, None, &line[name_end..]));
    }

    let body_start = name_end + 1;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line[body_start..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => {
                let close = body_start + i;
                return Some((name, Some(&line[body_start..close]), &line[close + 1..]));
            }
            _ => {}
        }
    }
    None
}

fn parse_labels(body: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut rest = body;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(',').trim();
        let after = &rest[eq + 1..];
        let Some(after) = after.trim_start().strip_prefix('"') else {
            break;
        };
        let mut value = String::new();
        let mut chars = after.char_indices();
        let mut end = after.len();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(match escaped {
                            'n' => '\n',
                            other => other,
                        });
                    }
                }
                '"' => {
                    end = i + 1;
                    break;
                }
                other => value.push(other),
            }
        }
        labels.insert(key.to_string(), value);
        rest = &after[end..];
    }
    labels
}

/// Sums the samples of `metric` whose `cache` label equals `cache`.
pub fn cache_entry_count(samples: &[Sample], metric: &str, cache: &str) -> Option<f64> {
    let mut matched = samples
        .iter()
        .filter(|s| s.name == metric && s.labels.get("cache").map(String::as_str) == Some(cache))
        .peekable();
    matched.peek()?;
    Some(matched.map(|s| s.value).sum())
}

/// Strips the `(mode)` suffix from a cache name: `default(dist_sync)` -> `default`.
pub fn cache_label(cache_name: &str) -> &str {
    cache_name
        .split('(')
        .next()
        .unwrap_or(cache_name)
        .trim()
}

/// Where and what to scrape on each node.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    /// Overrides the node's port.
    pub metrics_port: Option<u16>,
    /// Path of the metrics endpoint.
    pub metrics_path: String,
    /// Metric to sum.
    pub metric: String,
    /// Value of the `cache` label to match.
    pub cache: String,
}

impl ScrapeTarget {
    /// Metrics URL of the node at `address`.
    pub fn url_for(&self, address: &Address) -> String {
        let host = match address.ip() {
            Some(std::net::IpAddr::V6(ip)) => format!("[{}]", ip),
            Some(ip) => ip.to_string(),
            None => address.host().to_string(),
        };
        let port = self.metrics_port.unwrap_or(address.port());
        format!("http://{}:{}{}", host, port, self.metrics_path)
    }
}

/// Reads a node's entry count for one cache from its Prometheus endpoint.
pub struct EntryCountFetcher {
    client: reqwest::Client,
    target: Arc<ScrapeTarget>,
}

impl EntryCountFetcher {
    /// Scrapes `target` with `client`.
    pub fn new(client: reqwest::Client, target: Arc<ScrapeTarget>) -> Self {
        Self { client, target }
    }
}

#[async_trait]
impl MetricFetcher for EntryCountFetcher {
    async fn fetch(&self, address: &Address) -> cachewatch_poller::Result<MetricValue> {
        let url = self.target.url_for(address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PollerError::fetch(address, format!("Connection error: {}", e)))?;

        if !response.status().is_success() {
            return Err(PollerError::fetch(address, format!("HTTP {}", response.status())));
        }

        let text = response
            .text()
            .await
            .map_err(|e| PollerError::fetch(address, format!("Read error: {}", e)))?;

        let samples = parse_prometheus_text(&text);
        let count = cache_entry_count(&samples, &self.target.metric, &self.target.cache)
            .ok_or_else(|| {
                PollerError::fetch(
                    address,
                    format!("no {} sample for cache {}", self.target.metric, self.target.cache),
                )
            })?;
        Ok(count.max(0.0).round() as MetricValue)
    }
}

/// Opens one HTTP client per node and wraps it in a polling worker.
pub struct ScrapeWorkerFactory {
    target: Arc<ScrapeTarget>,
    timeout: Duration,
}

impl ScrapeWorkerFactory {
    /// Builds workers scraping `target`, each request bounded by `timeout`.
    pub fn new(target: ScrapeTarget, timeout: Duration) -> Self {
        Self {
            target: Arc::new(target),
            timeout,
        }
    }
}

#[async_trait]
impl WorkerFactory for ScrapeWorkerFactory {
    async fn create_worker(
        &self,
        address: &Address,
        _info: &NodeInfo,
    ) -> cachewatch_poller::Result<PollingWorker> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PollerError::worker_creation(address, e))?;
        let fetcher = EntryCountFetcher::new(client, self.target.clone());
        Ok(PollingWorker::new(address.clone(), Arc::new(fetcher)))
    }
}
