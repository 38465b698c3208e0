//! Per-node polling worker.
//!
//! A [`PollingWorker`] owns one background task that repeatedly fetches a
//! single node's metric and hands each successful reading to a
//! [`ValueSink`]. Fetch failures are logged and the previous value is kept;
//! only [`PollingWorker::stop`] ends the loop.

use crate::fetch::MetricFetcher;
use crate::node::{Address, MetricValue};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Default interval between two fetches of the same node.
pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_millis(2000);

/// Smallest accepted refresh interval.
pub const MIN_REFRESH_RATE: Duration = Duration::from_millis(1);

/// Lifecycle of a polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, loop not started.
    Created,
    /// Loop is fetching and sleeping.
    Running,
    /// Stop requested; the loop has not exited yet.
    Stopping,
    /// Loop has exited (or was never started).
    Stopped,
}

/// Destination of a worker's readings.
pub trait ValueSink: Send + Sync + 'static {
    /// Stores the latest value. Returns `false` when the sink no longer
    /// accepts values from this worker.
    fn publish(&self, value: MetricValue) -> bool;
}

/// Background loop polling one node's metric at a fixed interval.
///
/// A worker is bound to a single address for its whole life and is never
/// restarted. Dropping a worker stops it.
pub struct PollingWorker {
    address: Address,
    fetcher: Arc<dyn MetricFetcher>,
    refresh_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
}

impl PollingWorker {
    /// Creates a worker in the [`WorkerState::Created`] state.
    pub fn new(address: Address, fetcher: Arc<dyn MetricFetcher>) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        Self {
            address,
            fetcher,
            refresh_ms: Arc::new(AtomicU64::new(DEFAULT_REFRESH_RATE.as_millis() as u64)),
            cancel: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// Sets the interval used for every sleep that starts after this call.
    pub fn set_refresh_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_REFRESH_RATE);
        self.refresh_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current refresh interval.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.load(Ordering::Relaxed))
    }

    /// Address this worker polls.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Starts the polling loop on the current tokio runtime.
    ///
    /// Returns `false` if the worker was already started or stopped.
    pub fn start(&self, sink: Arc<dyn ValueSink>) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == WorkerState::Created {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(addr = %self.address, state = ?self.state(), "worker start ignored");
            return false;
        }

        let span = info_span!("poller", addr = %self.address);
        tokio::spawn(
            poll_loop(
                self.address.clone(),
                self.fetcher.clone(),
                self.refresh_ms.clone(),
                self.cancel.clone(),
                sink,
                self.state.clone(),
            )
            .instrument(span),
        );
        true
    }

    /// Requests the loop to stop. Idempotent.
    ///
    /// A sleeping or fetching loop is woken immediately; no fetch starts
    /// after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state.send_if_modified(|state| match *state {
            WorkerState::Created => {
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::Running => {
                *state = WorkerState::Stopping;
                true
            }
            _ => false,
        });
    }

    /// Waits until the loop has exited.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == WorkerState::Stopped).await;
    }
}

impl Drop for PollingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWorker")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("refresh_interval", &self.refresh_interval())
            .finish()
    }
}

async fn poll_loop(
    address: Address,
    fetcher: Arc<dyn MetricFetcher>,
    refresh_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
    sink: Arc<dyn ValueSink>,
    state: Arc<watch::Sender<WorkerState>>,
) {
    debug!("poller started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let fetch = AssertUnwindSafe(fetcher.fetch(&address)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = fetch => outcome,
        };
        match outcome {
            Ok(Ok(value)) => {
                if sink.publish(value) {
                    debug!(value, "fetched");
                } else {
                    debug!(value, "reading discarded, node no longer registered");
                }
            }
            Ok(Err(e)) => warn!(error = %e, "fetch failed, keeping previous value"),
            Err(_) => warn!("fetcher panicked, keeping previous value"),
        }

        let interval = Duration::from_millis(refresh_ms.load(Ordering::Relaxed));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    state.send_replace(WorkerState::Stopped);
    info!("poller stopped");
}
