//! Registry of live pollers, keyed by node id.
//!
//! Each entry pairs a running [`PollingWorker`] with the [`NodeInfo`] it
//! writes into. Entries carry a generation number; a worker can only
//! publish into the entry it was registered with, so a late write from a
//! removed worker never resurrects or overwrites a slot.

use crate::error::{PollerError, Result};
use crate::node::{Address, MetricValue, NodeId, NodeInfo};
use crate::worker::{PollingWorker, ValueSink, WorkerState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

struct RegistryEntry {
    generation: u64,
    worker: PollingWorker,
    info: NodeInfo,
}

type EntryMap = DashMap<NodeId, RegistryEntry>;

/// Concurrent map from node id to its worker and latest value.
pub struct WorkerRegistry {
    entries: Arc<EntryMap>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    /// Creates an empty, open registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Latest info for `id`.
    pub fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.entries.get(id).map(|e| e.info.clone())
    }

    /// True if `id` has a worker.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once [`close`](WorkerRegistry::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers `worker` under `id` and starts it.
    ///
    /// The slot is reserved before the worker starts, so its first reading
    /// always lands. Fails with [`PollerError::DuplicateNode`] if `id` is
    /// present and with [`PollerError::RegistryClosed`] after [`close`];
    /// a rejected worker is stopped. Returns the entry's generation.
    ///
    /// [`close`]: WorkerRegistry::close
    pub fn put(&self, id: NodeId, worker: PollingWorker, info: NodeInfo) -> Result<u64> {
        if self.is_closed() {
            worker.stop();
            return Err(PollerError::RegistryClosed);
        }

        let generation = match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => {
                worker.stop();
                return Err(PollerError::DuplicateNode(id.to_string()));
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let publisher = Arc::new(ValuePublisher {
                    entries: Arc::downgrade(&self.entries),
                    id: id.clone(),
                    generation,
                });
                worker.start(publisher);
                slot.insert(RegistryEntry {
                    generation,
                    worker,
                    info,
                });
                generation
            }
        };

        // close() may have drained the map between the check above and the insert.
        if self.is_closed() {
            if let Some((worker, _)) = self.remove(&id) {
                worker.stop();
            }
            return Err(PollerError::RegistryClosed);
        }

        debug!(%id, generation, "registered poller");
        Ok(generation)
    }

    /// Removes the entry for `id`, handing back its worker and last info.
    ///
    /// The caller is responsible for stopping the worker.
    pub fn remove(&self, id: &NodeId) -> Option<(PollingWorker, NodeInfo)> {
        self.entries
            .remove(id)
            .map(|(_, entry)| (entry.worker, entry.info))
    }

    /// Copies every node's current info, ordered by id.
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<NodeInfo> = self
            .entries
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Ids and addresses of every registered node.
    pub fn members(&self) -> Vec<(NodeId, Address)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.info.address.clone()))
            .collect()
    }

    /// State of the worker registered under `id`.
    pub fn worker_state(&self, id: &NodeId) -> Option<WorkerState> {
        self.entries.get(id).map(|e| e.worker.state())
    }

    /// Generation of the entry registered under `id`.
    pub fn generation(&self, id: &NodeId) -> Option<u64> {
        self.entries.get(id).map(|e| e.generation)
    }

    /// Applies `interval` to every registered worker.
    pub fn set_refresh_interval(&self, interval: Duration) {
        for entry in self.entries.iter() {
            entry.worker.set_refresh_interval(interval);
        }
    }

    /// Rejects further registrations, then removes and stops every entry.
    ///
    /// Returns the number of workers stopped. Safe to call repeatedly.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<NodeId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for id in ids {
            if let Some((worker, _)) = self.remove(&id) {
                worker.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "registry closed");
        }
        stopped
    }
}

/// Write handle bound to one registry entry generation.
struct ValuePublisher {
    entries: Weak<EntryMap>,
    id: NodeId,
    generation: u64,
}

impl ValueSink for ValuePublisher {
    fn publish(&self, value: MetricValue) -> bool {
        let Some(entries) = self.entries.upgrade() else {
            return false;
        };
        let published = match entries.get_mut(&self.id) {
            Some(mut entry) if entry.generation == self.generation => {
                entry.info.record(value);
                true
            }
            _ => false,
        };
        published
    }
}
