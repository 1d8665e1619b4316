use crate::pool::WorkerId;
use crate::range::NodeHash;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Ranges this process dispatched and has not yet heard back about.
///
/// Only closes the window between "claim returned a node" and "worker
/// registered" inside one process; the store claim is what keeps separate
/// processes apart.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<WorkerId, NodeHash>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `worker → hash`, returning the hash previously tracked for the worker.
    pub fn track(&self, worker: WorkerId, hash: NodeHash) -> Option<NodeHash> {
        self.lock().insert(worker, hash)
    }

    pub fn untrack(&self, worker: WorkerId) -> Option<NodeHash> {
        self.lock().remove(&worker)
    }

    pub fn contains_node(&self, hash: &NodeHash) -> bool {
        self.lock().values().any(|tracked| tracked == hash)
    }

    pub fn worker_for(&self, hash: &NodeHash) -> Option<WorkerId> {
        self.lock()
            .iter()
            .find(|(_, tracked)| *tracked == hash)
            .map(|(worker, _)| *worker)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, NodeHash>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
