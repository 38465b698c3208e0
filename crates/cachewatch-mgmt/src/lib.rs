#![warn(missing_docs)]

//! cachewatch front end: the node info REST service, the Prometheus
//! entry-count scraper that feeds its pollers, and the CLI.

/// axum node info service.
pub mod api;
/// Command line definition.
pub mod cli;
/// Service configuration.
pub mod config;
/// Prometheus entry-count scraper.
pub mod scraper;

pub use api::{ApiError, NodeInfoService};
pub use config::WatchConfig;
pub use scraper::{EntryCountFetcher, ScrapeWorkerFactory};
