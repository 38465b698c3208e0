#![warn(missing_docs)]

//! cachewatch core: keeps one metric poller per live cache-cluster node and
//! serves the latest readings without blocking on any poller.

pub mod directory;
pub mod error;
pub mod fetch;
pub mod manager;
pub mod node;
pub mod reconcile;
pub mod registry;
pub mod worker;

pub use directory::{ClusterDirectory, StaticDirectory, TopologyDirectory, TopologyListener};
pub use error::{PollerError, Result};
pub use fetch::{MetricFetcher, SharedFetcherWorkerFactory, WorkerFactory};
pub use manager::{PollerManager, PollerManagerBuilder};
pub use node::{derive_node_id, Address, HostResolver, MetricValue, NodeId, NodeInfo, SystemResolver};
pub use reconcile::{PassReport, ReconciliationLoop};
pub use registry::WorkerRegistry;
pub use worker::{PollingWorker, ValueSink, WorkerState, DEFAULT_REFRESH_RATE, MIN_REFRESH_RATE};
