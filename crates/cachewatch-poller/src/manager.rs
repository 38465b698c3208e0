//! Poller manager: the owner of the registry and reconciliation loop.
//!
//! ```text
//! init(name) ──> reconcile_pass() ──> spawn ReconciliationLoop::run
//!                                          │ every refresh interval
//!                                          ▼
//!                        ClusterDirectory ──> WorkerRegistry ──> PollingWorker × N
//!                                                   ▲
//! get_all_values() ── snapshot ─────────────────────┘
//! ```

use crate::directory::ClusterDirectory;
use crate::error::{PollerError, Result};
use crate::fetch::WorkerFactory;
use crate::node::{HostResolver, NodeId, NodeInfo, SystemResolver};
use crate::reconcile::{PassReport, ReconciliationLoop};
use crate::registry::WorkerRegistry;
use crate::worker::{WorkerState, DEFAULT_REFRESH_RATE, MIN_REFRESH_RATE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

enum Lifecycle {
    Idle,
    Starting,
    Running { name: String },
    Destroyed,
}

/// Builder for [`PollerManager`].
pub struct PollerManagerBuilder {
    directory: Arc<dyn ClusterDirectory>,
    factory: Arc<dyn WorkerFactory>,
    resolver: Arc<dyn HostResolver>,
    refresh_rate: Duration,
}

impl PollerManagerBuilder {
    /// Overrides the host resolver (default: [`SystemResolver`]).
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the initial refresh rate (default: 2 s).
    pub fn refresh_rate(mut self, rate: Duration) -> Self {
        self.refresh_rate = rate;
        self
    }

    /// Builds an idle manager.
    pub fn build(self) -> PollerManager {
        let refresh_ms = Arc::new(AtomicU64::new(clamp_ms(self.refresh_rate)));
        let registry = Arc::new(WorkerRegistry::new());
        let reconciler = Arc::new(ReconciliationLoop::new(
            self.directory,
            self.factory,
            self.resolver,
            registry.clone(),
            refresh_ms.clone(),
        ));
        PollerManager {
            reconciler,
            registry,
            refresh_ms,
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
        }
    }
}

fn clamp_ms(rate: Duration) -> u64 {
    rate.max(MIN_REFRESH_RATE).as_millis() as u64
}

/// Keeps one poller per live cluster node and serves their latest values.
///
/// Construct with [`PollerManager::builder`], call [`init`] once, read with
/// [`get_all_values`] and tear down with [`destroy`] (also done on drop).
///
/// [`init`]: PollerManager::init
/// [`get_all_values`]: PollerManager::get_all_values
/// [`destroy`]: PollerManager::destroy
pub struct PollerManager {
    reconciler: Arc<ReconciliationLoop>,
    registry: Arc<WorkerRegistry>,
    refresh_ms: Arc<AtomicU64>,
    lifecycle: Mutex<Lifecycle>,
    /// Cancelled by `destroy`; interrupts the loop and any pass in flight.
    shutdown: CancellationToken,
}

impl PollerManager {
    /// Starts building a manager over `directory` and `factory`.
    pub fn builder(
        directory: Arc<dyn ClusterDirectory>,
        factory: Arc<dyn WorkerFactory>,
    ) -> PollerManagerBuilder {
        PollerManagerBuilder {
            directory,
            factory,
            resolver: Arc::new(SystemResolver),
            refresh_rate: DEFAULT_REFRESH_RATE,
        }
    }

    /// Runs a first reconciliation pass, then starts the periodic loop.
    ///
    /// A failing directory on the first pass is logged, not returned: the
    /// loop keeps retrying. Fails if the manager was already initialized or
    /// has been destroyed, including a [`destroy`](PollerManager::destroy)
    /// that lands while the first pass is still running.
    pub async fn init(&self, name: &str) -> Result<()> {
        {
            let mut lifecycle = self.lock_lifecycle();
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Starting,
                Lifecycle::Destroyed => return Err(PollerError::Destroyed),
                _ => return Err(PollerError::AlreadyInitialized),
            }
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(manager = name, "destroyed during initial cluster pass");
                return Err(PollerError::Destroyed);
            }
            outcome = self.reconciler.reconcile_pass() => match outcome {
                Ok(report) => info!(manager = name, ?report, "initial cluster pass done"),
                Err(e) => warn!(manager = name, error = %e, "initial cluster pass failed"),
            },
        }

        let mut lifecycle = self.lock_lifecycle();
        if !matches!(*lifecycle, Lifecycle::Starting) {
            return Err(PollerError::Destroyed);
        }
        info!(manager = name, "starting reconciliation loop");
        let span = info_span!("reconcile", manager = name);
        tokio::spawn(
            self.reconciler
                .clone()
                .run(self.shutdown.clone())
                .instrument(span),
        );
        *lifecycle = Lifecycle::Running {
            name: name.to_string(),
        };
        Ok(())
    }

    /// Stops the reconciliation loop and signals every worker to stop.
    ///
    /// A pass in flight (the first one run by `init`, or one from
    /// [`reconcile_now`](PollerManager::reconcile_now)) is abandoned.
    /// Returns once every stop signal is issued; worker tasks finish on
    /// their own. Idempotent.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::Destroyed);
        let name = match previous {
            Lifecycle::Destroyed => {
                debug!("manager already destroyed");
                return;
            }
            Lifecycle::Running { name } => Some(name),
            Lifecycle::Idle | Lifecycle::Starting => None,
        };
        self.shutdown.cancel();
        let stopped = self.registry.close();
        info!(manager = name.as_deref().unwrap_or("-"), stopped, "poller manager destroyed");
    }

    /// Point-in-time copy of every node's latest value. Never blocks on a
    /// poller and never triggers a fetch or a pass.
    pub fn get_all_values(&self) -> Vec<NodeInfo> {
        self.registry.snapshot()
    }

    /// Latest info for one node.
    pub fn get_node(&self, id: &NodeId) -> Option<NodeInfo> {
        self.registry.get(id)
    }

    /// Number of nodes currently polled.
    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    /// State of the worker polling `id`.
    pub fn worker_state(&self, id: &NodeId) -> Option<WorkerState> {
        self.registry.worker_state(id)
    }

    /// Generation of the worker polling `id`; changes only when the node's
    /// worker is replaced.
    pub fn worker_generation(&self, id: &NodeId) -> Option<u64> {
        self.registry.generation(id)
    }

    /// True between a successful [`init`](PollerManager::init) and
    /// [`destroy`](PollerManager::destroy).
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Running { .. })
    }

    /// Current refresh rate.
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.load(Ordering::Relaxed))
    }

    /// Changes the refresh rate for workers started from now on and for
    /// the reconciliation timer. Running workers keep their interval until
    /// [`propagate_refresh_rate`](PollerManager::propagate_refresh_rate).
    pub fn set_refresh_rate(&self, rate: Duration) {
        self.refresh_ms.store(clamp_ms(rate), Ordering::Relaxed);
    }

    /// Pushes the current refresh rate to every running worker. A sleep
    /// already in progress is not shortened.
    pub fn propagate_refresh_rate(&self) {
        self.registry.set_refresh_interval(self.refresh_rate());
    }

    /// Runs one reconciliation pass now, serialised with the timer.
    pub async fn reconcile_now(&self) -> Result<PassReport> {
        if matches!(*self.lock_lifecycle(), Lifecycle::Destroyed) {
            return Err(PollerError::Destroyed);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(PollerError::Destroyed),
            outcome = self.reconciler.reconcile_pass() => outcome,
        }
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollerManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
