//! Metric fetching and worker construction seams.

use crate::error::Result;
use crate::node::{Address, MetricValue, NodeInfo};
use crate::worker::PollingWorker;
use async_trait::async_trait;
use std::sync::Arc;

/// Reads the current metric of one node. May block and may fail.
///
/// Implementations own their timeout policy; the poller never imposes one.
#[async_trait]
pub trait MetricFetcher: Send + Sync {
    /// Fetches the current value for `address`.
    async fn fetch(&self, address: &Address) -> Result<MetricValue>;
}

/// Builds the polling worker for a newly discovered node.
///
/// Construction may open a management channel to the node; a failure is
/// reported as [`crate::PollerError::WorkerCreation`] and the node is
/// retried on the next reconciliation pass.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Creates an unstarted worker bound to `address`.
    async fn create_worker(&self, address: &Address, info: &NodeInfo) -> Result<PollingWorker>;
}

/// Factory handing every worker the same fetcher.
#[derive(Clone)]
pub struct SharedFetcherWorkerFactory {
    fetcher: Arc<dyn MetricFetcher>,
}

impl SharedFetcherWorkerFactory {
    /// Builds every worker around `fetcher`.
    pub fn new(fetcher: Arc<dyn MetricFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl WorkerFactory for SharedFetcherWorkerFactory {
    async fn create_worker(&self, address: &Address, _info: &NodeInfo) -> Result<PollingWorker> {
        Ok(PollingWorker::new(address.clone(), self.fetcher.clone()))
    }
}
