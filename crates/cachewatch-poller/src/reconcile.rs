//! Membership reconciliation.
//!
//! A pass diffs the directory's live addresses against the registry:
//! new nodes get a started worker, departed nodes have theirs removed and
//! stopped, and nodes present on both sides are left alone. Every
//! per-node failure is logged and skipped; a directory failure skips the
//! whole pass without touching the registry.

use crate::directory::ClusterDirectory;
use crate::error::{PollerError, Result};
use crate::fetch::WorkerFactory;
use crate::node::{derive_node_id, Address, HostResolver, NodeId, NodeInfo};
use crate::registry::WorkerRegistry;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome counters of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Workers created and started.
    pub started: usize,
    /// Workers removed because their node left.
    pub stopped: usize,
    /// Nodes already polled and left untouched.
    pub retained: usize,
    /// Nodes skipped this pass (resolution or worker creation failed).
    pub skipped: usize,
}

/// Periodic membership diff driving the worker registry.
pub struct ReconciliationLoop {
    directory: Arc<dyn ClusterDirectory>,
    factory: Arc<dyn WorkerFactory>,
    resolver: Arc<dyn HostResolver>,
    registry: Arc<WorkerRegistry>,
    refresh_ms: Arc<AtomicU64>,
    pass_lock: Mutex<()>,
}

impl ReconciliationLoop {
    /// Wires a loop over `registry`; `refresh_ms` is shared with the manager.
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        factory: Arc<dyn WorkerFactory>,
        resolver: Arc<dyn HostResolver>,
        registry: Arc<WorkerRegistry>,
        refresh_ms: Arc<AtomicU64>,
    ) -> Self {
        Self {
            directory,
            factory,
            resolver,
            registry,
            refresh_ms,
            pass_lock: Mutex::new(()),
        }
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.load(Ordering::Relaxed))
    }

    /// Runs one pass. Passes on the same loop never overlap.
    ///
    /// Returns [`PollerError::DirectoryUnavailable`] (or whatever the
    /// directory raised) when membership could not be listed; the
    /// registry is untouched in that case.
    pub async fn reconcile_pass(&self) -> Result<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let live = self.directory.list_nodes().await?;
        info!(nodes = live.len(), "updating cluster list");

        let mut report = PassReport::default();
        let mut seen: HashSet<NodeId> = HashSet::with_capacity(live.len());
        let mut unresolved: HashSet<Address> = HashSet::new();

        for addr in &live {
            let id = match derive_node_id(addr, self.resolver.as_ref()).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(%addr, error = %e, "cannot derive node id, skipping this pass");
                    unresolved.insert(addr.clone());
                    report.skipped += 1;
                    continue;
                }
            };
            debug!(%id, %addr, "derived node id");

            if !seen.insert(id.clone()) {
                debug!(%id, %addr, "address aliases a node already seen this pass");
                continue;
            }
            if self.registry.contains(&id) {
                report.retained += 1;
                continue;
            }

            match self.start_worker(id.clone(), addr).await {
                Ok(()) => {
                    info!(%id, %addr, "started poller");
                    report.started += 1;
                }
                Err(PollerError::RegistryClosed) => {
                    debug!("registry closed mid-pass");
                    return Ok(report);
                }
                Err(e @ PollerError::DuplicateNode(_)) => {
                    error!(%id, error = %e, "registry already held a node this pass considered new");
                    debug_assert!(false, "{}", e);
                }
                Err(e) => {
                    warn!(%id, %addr, error = %e, "cannot start poller, retrying next pass");
                    report.skipped += 1;
                }
            }
        }

        for (id, addr) in self.registry.members() {
            if seen.contains(&id) || unresolved.contains(&addr) {
                continue;
            }
            if let Some((worker, _)) = self.registry.remove(&id) {
                worker.stop();
                info!(%id, %addr, "node left, stopped poller");
                report.stopped += 1;
            }
        }

        Ok(report)
    }

    async fn start_worker(&self, id: NodeId, addr: &Address) -> Result<()> {
        let info = NodeInfo::new(id.clone(), addr.clone());
        let worker = self.factory.create_worker(addr, &info).await?;
        worker.set_refresh_interval(self.refresh_interval());
        self.registry.put(id, worker, info).map(|_| ())
    }

    /// Runs passes until `cancel` fires.
    ///
    /// Waits one refresh interval (or a directory change signal) before
    /// each pass; a slow pass delays the next one rather than overlapping
    /// it. Panics raised by collaborators are contained to the pass.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = self.refresh_interval();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.directory.changed() => debug!("directory signalled a change"),
            }

            let pass = AssertUnwindSafe(self.reconcile_pass()).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = pass => match outcome {
                    Ok(Ok(report)) => debug!(?report, "reconciliation pass done"),
                    Ok(Err(e)) => error!(error = %e, "error when updating cluster list"),
                    Err(_) => error!("reconciliation pass panicked"),
                },
            }
        }
        info!("reconciliation loop stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetch::MetricFetcher;
    use crate::node::tests::TableResolver;
    use crate::node::MetricValue;
    use crate::worker::{PollingWorker, WorkerState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    /// Directory whose answer can be swapped or made to fail.
    #[derive(Default)]
    pub(crate) struct ScriptedDirectory {
        nodes: StdMutex<HashSet<Address>>,
        failing: AtomicBool,
    }

    impl ScriptedDirectory {
        pub(crate) fn set(&self, nodes: &[&str]) {
            *self.nodes.lock().unwrap() = nodes.iter().map(|s| s.parse().unwrap()).collect();
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ClusterDirectory for ScriptedDirectory {
        async fn list_nodes(&self) -> Result<HashSet<Address>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PollerError::DirectoryUnavailable("scripted outage".to_string()));
            }
            Ok(self.nodes.lock().unwrap().clone())
        }
    }

    /// Fetcher answering per address; unknown addresses fail.
    #[derive(Default)]
    pub(crate) struct MapFetcher {
        pub(crate) values: StdMutex<HashMap<Address, MetricValue>>,
    }

    #[async_trait]
    impl MetricFetcher for MapFetcher {
        async fn fetch(&self, address: &Address) -> Result<MetricValue> {
            self.values
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .ok_or_else(|| PollerError::fetch(address, "no value"))
        }
    }

    /// Factory that can refuse specific addresses.
    #[derive(Default)]
    pub(crate) struct TestFactory {
        pub(crate) fetcher: Arc<MapFetcher>,
        pub(crate) refuse: StdMutex<HashSet<Address>>,
        pub(crate) created: StdMutex<Vec<Address>>,
    }

    #[async_trait]
    impl WorkerFactory for TestFactory {
        async fn create_worker(&self, address: &Address, _info: &NodeInfo) -> Result<PollingWorker> {
            if self.refuse.lock().unwrap().contains(address) {
                return Err(PollerError::worker_creation(address, "channel refused"));
            }
            self.created.lock().unwrap().push(address.clone());
            Ok(PollingWorker::new(address.clone(), self.fetcher.clone()))
        }
    }

    struct Fixture {
        directory: Arc<ScriptedDirectory>,
        factory: Arc<TestFactory>,
        registry: Arc<WorkerRegistry>,
        reconciler: Arc<ReconciliationLoop>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.registry.close();
        }
    }

    fn fixture(resolver: TableResolver) -> Fixture {
        let directory = Arc::new(ScriptedDirectory::default());
        let factory = Arc::new(TestFactory::default());
        let registry = Arc::new(WorkerRegistry::new());
        let reconciler = Arc::new(ReconciliationLoop::new(
            directory.clone(),
            factory.clone(),
            Arc::new(resolver),
            registry.clone(),
            Arc::new(AtomicU64::new(20)),
        ));
        Fixture { directory, factory, registry, reconciler }
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn ids(registry: &WorkerRegistry) -> Vec<String> {
        registry.snapshot().into_iter().map(|i| i.id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_pass_starts_one_worker_per_node() {
        let f = fixture(TableResolver::default());
        f.directory.set(&["10.0.0.1:11222", "10.0.0.2:11222"]);

        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.started, 2);
        assert_eq!(ids(&f.registry), vec!["10-0-0-1-11222", "10-0-0-2-11222"]);
        assert_eq!(f.registry.worker_state(&id("10-0-0-1-11222")), Some(WorkerState::Running));
    }

    #[tokio::test]
    async fn test_membership_change_replaces_departed_keeps_stable() {
        let f = fixture(TableResolver::default());
        f.directory.set(&["10.0.0.1:11222", "10.0.0.2:11222"]);
        f.reconciler.reconcile_pass().await.unwrap();
        let b = id("10-0-0-2-11222");
        let b_generation = f.registry.generation(&b).unwrap();

        f.directory.set(&["10.0.0.2:11222", "10.0.0.3:11222"]);
        let report = f.reconciler.reconcile_pass().await.unwrap();

        assert_eq!(report, PassReport { started: 1, stopped: 1, retained: 1, skipped: 0 });
        assert_eq!(ids(&f.registry), vec!["10-0-0-2-11222", "10-0-0-3-11222"]);
        assert_eq!(f.registry.generation(&b), Some(b_generation));
        assert_eq!(f.factory.created.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_node_is_skipped() {
        let f = fixture(TableResolver::default());
        f.directory.set(&["ghost.invalid:11222"]);

        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(f.registry.is_empty());
        assert!(f.factory.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_failure_leaves_registry_untouched() {
        let f = fixture(TableResolver::default());
        f.directory.set(&["10.0.0.1:11222", "10.0.0.2:11222"]);
        f.reconciler.reconcile_pass().await.unwrap();
        let before = ids(&f.registry);

        f.directory.set(&[]);
        f.directory.set_failing(true);
        let err = f.reconciler.reconcile_pass().await.unwrap_err();
        assert!(matches!(err, PollerError::DirectoryUnavailable(_)));
        assert_eq!(ids(&f.registry), before);
    }

    #[tokio::test]
    async fn test_worker_creation_failure_retried_next_pass() {
        let f = fixture(TableResolver::default());
        let a: Address = "10.0.0.1:11222".parse().unwrap();
        f.factory.refuse.lock().unwrap().insert(a.clone());
        f.directory.set(&["10.0.0.1:11222", "10.0.0.2:11222"]);

        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(ids(&f.registry), vec!["10-0-0-2-11222"]);

        f.factory.refuse.lock().unwrap().clear();
        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(report.retained, 1);
        assert_eq!(f.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_aliases_share_one_worker() {
        let resolver = TableResolver::default()
            .with("node1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let f = fixture(resolver);
        f.directory.set(&["node1:11222", "10.0.0.1:11222"]);

        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.factory.created.lock().unwrap().len(), 1);

        // Dropping one alias keeps the node.
        f.directory.set(&["node1:11222"]);
        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.stopped, 0);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_live_node_with_failed_resolution_is_retained() {
        let resolver = TableResolver::default()
            .with("node1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let directory = Arc::new(ScriptedDirectory::default());
        let registry = Arc::new(WorkerRegistry::new());
        let factory = Arc::new(TestFactory::default());
        let first = ReconciliationLoop::new(
            directory.clone(),
            factory.clone(),
            Arc::new(resolver),
            registry.clone(),
            Arc::new(AtomicU64::new(20)),
        );
        directory.set(&["node1:11222"]);
        first.reconcile_pass().await.unwrap();
        assert_eq!(registry.len(), 1);

        // Same registry, resolver that has forgotten the host.
        let second = ReconciliationLoop::new(
            directory.clone(),
            factory,
            Arc::new(TableResolver::default()),
            registry.clone(),
            Arc::new(AtomicU64::new(20)),
        );
        let report = second.reconcile_pass().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.stopped, 0);
        assert_eq!(registry.len(), 1);
        registry.close();
    }

    #[tokio::test]
    async fn test_departed_worker_is_stopped() {
        let f = fixture(TableResolver::default());
        f.directory.set(&["10.0.0.1:11222"]);
        f.reconciler.reconcile_pass().await.unwrap();

        f.directory.set(&[]);
        let report = f.reconciler.reconcile_pass().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_new_worker_uses_current_refresh_rate() {
        let f = fixture(TableResolver::default());
        f.reconciler.refresh_ms.store(750, Ordering::Relaxed);
        f.directory.set(&["10.0.0.1:11222"]);
        f.reconciler.reconcile_pass().await.unwrap();

        // Reach the worker through a removal to inspect it.
        let (worker, _) = f.registry.remove(&id("10-0-0-1-11222")).unwrap();
        assert_eq!(worker.refresh_interval(), Duration::from_millis(750));
        worker.stop();
    }

    #[tokio::test]
    async fn test_run_converges_and_stops_on_cancel() {
        let f = fixture(TableResolver::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.reconciler.clone().run(cancel.clone()));

        f.directory.set(&["10.0.0.1:11222"]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.registry.len(), 1);

        f.directory.set(&["10.0.0.2:11222", "10.0.0.3:11222"]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ids(&f.registry), vec!["10-0-0-2-11222", "10-0-0-3-11222"]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_survives_directory_outage() {
        let f = fixture(TableResolver::default());
        let cancel = CancellationToken::new();
        f.directory.set(&["10.0.0.1:11222"]);
        f.directory.set_failing(true);
        let handle = tokio::spawn(f.reconciler.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f.registry.is_empty());
        f.directory.set_failing(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.registry.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
