//! Sources of cluster membership.
//!
//! The reconciliation loop only needs [`ClusterDirectory::list_nodes`]. A
//! cache client that learns about topology changes pushes them through
//! [`TopologyListener`]; [`TopologyDirectory`] bridges the two.

use crate::error::{PollerError, Result};
use crate::node::Address;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::info;

/// Supplies the current set of live node addresses.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Current live members. Fails with
    /// [`PollerError::DirectoryUnavailable`] when membership is unknown.
    async fn list_nodes(&self) -> Result<HashSet<Address>>;

    /// Resolves when membership may have changed since the last call.
    ///
    /// The default never resolves, leaving the reconciliation timer as the
    /// only trigger.
    async fn changed(&self) {
        std::future::pending::<()>().await
    }
}

/// Receives topology updates from a cache client.
pub trait TopologyListener: Send + Sync {
    /// Called with the full server list after every topology change.
    fn on_topology_changed(&self, addresses: Vec<Address>);
}

/// Fixed membership, typically taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    nodes: HashSet<Address>,
}

impl StaticDirectory {
    /// Serves exactly `nodes`.
    pub fn new(nodes: impl IntoIterator<Item = Address>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ClusterDirectory for StaticDirectory {
    async fn list_nodes(&self) -> Result<HashSet<Address>> {
        Ok(self.nodes.clone())
    }
}

/// Directory fed by topology events.
///
/// Unavailable until the first event arrives. Each event wakes the
/// reconciliation loop so new members are picked up without waiting for
/// the next tick.
#[derive(Debug, Default)]
pub struct TopologyDirectory {
    servers: RwLock<Option<HashSet<Address>>>,
    notify: Notify,
}

impl TopologyDirectory {
    /// Starts unavailable until the first topology update.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TopologyListener for TopologyDirectory {
    fn on_topology_changed(&self, addresses: Vec<Address>) {
        info!(servers = addresses.len(), "topology updated");
        let servers: HashSet<Address> = addresses.into_iter().collect();
        *self
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(servers);
        self.notify.notify_one();
    }
}

#[async_trait]
impl ClusterDirectory for TopologyDirectory {
    async fn list_nodes(&self) -> Result<HashSet<Address>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PollerError::DirectoryUnavailable("no topology received yet".to_string()))
    }

    async fn changed(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_static_directory_lists_configured_nodes() {
        let dir = StaticDirectory::new(vec![addr("10.0.0.1:11222"), addr("10.0.0.2:11222")]);
        let nodes = dir.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.contains(&addr("10.0.0.1:11222")));
    }

    #[tokio::test]
    async fn test_static_directory_never_signals_change() {
        let dir = StaticDirectory::default();
        assert!(timeout(Duration::from_millis(20), dir.changed()).await.is_err());
    }

    #[tokio::test]
    async fn test_topology_directory_unavailable_before_first_event() {
        let dir = TopologyDirectory::new();
        let err = dir.list_nodes().await.unwrap_err();
        assert!(matches!(err, PollerError::DirectoryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_topology_directory_tracks_latest_event() {
        let dir = TopologyDirectory::new();
        dir.on_topology_changed(vec![addr("10.0.0.1:11222"), addr("10.0.0.2:11222")]);
        dir.on_topology_changed(vec![addr("10.0.0.2:11222"), addr("10.0.0.3:11222")]);

        let nodes = dir.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes.contains(&addr("10.0.0.1:11222")));
        assert!(nodes.contains(&addr("10.0.0.3:11222")));
    }

    #[tokio::test]
    async fn test_topology_event_wakes_waiter() {
        let dir = TopologyDirectory::new();
        dir.on_topology_changed(vec![addr("10.0.0.1:11222")]);
        timeout(Duration::from_millis(100), dir.changed())
            .await
            .expect("stored notification should wake the waiter");
    }

    #[tokio::test]
    async fn test_empty_topology_is_available() {
        let dir = TopologyDirectory::new();
        dir.on_topology_changed(Vec::new());
        assert!(dir.list_nodes().await.unwrap().is_empty());
    }
}
