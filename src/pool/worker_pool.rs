//! Worker pool orchestration for the replay scheduler.
//!
//! This module owns worker creation, the setup/load/dispose round trips, pool
//! sizing, and the release hook that lets the scheduler refill capacity.

use super::process::spawn_worker;
use super::registry::{SharedData, TaskRegistry};
use super::types::{
    LifecycleStage, TaskEvent, WorkerCommand, WorkerId, WorkerMessage, WorkerPoolError,
    WorkerState,
};
use crate::runtime::telemetry::Telemetry;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Called after a released worker is back in the available set.
pub type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

type MessageReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<WorkerMessage>>>;

/// Threads the host offers, falling back to one when unknown.
pub fn host_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

/// Pool capacity: the requested thread count, capped by the host threads left
/// after reserving `reserved_threads`, and never below one.
pub fn worker_max_count(requested: usize, host_threads: usize, reserved_threads: usize) -> usize {
    requested
        .min(host_threads.saturating_sub(reserved_threads))
        .max(1)
}

#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub max_workers: usize,
    /// When set the pool is homogeneous: every worker loads this task.
    pub default_task: Option<String>,
    pub shared_data: SharedData,
    pub lifecycle_timeout: Duration,
}

/// A worker acquired through [`WorkerPool::get_worker`] and loaded with `pointer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pointer: String,
}

struct WorkerSlot {
    state: WorkerState,
    pointer: Option<String>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    messages: MessageReceiver,
    kill: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<WorkerId, WorkerSlot>,
    available: VecDeque<WorkerId>,
    pending_spawns: usize,
    closed: bool,
}

impl PoolState {
    fn active_count(&self) -> usize {
        self.slots.len() - self.available.len() + self.pending_spawns
    }
}

pub struct WorkerPool {
    options: WorkerPoolOptions,
    registry: Arc<TaskRegistry>,
    telemetry: Arc<Telemetry>,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
    release_hook: Mutex<Option<ReleaseHook>>,
}

enum Acquired {
    Reused(WorkerId),
    Spawn(WorkerId),
}

impl WorkerPool {
    pub fn new(
        options: WorkerPoolOptions,
        registry: Arc<TaskRegistry>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let options = WorkerPoolOptions {
            max_workers: options.max_workers.max(1),
            ..options
        };
        Self {
            options,
            registry,
            telemetry,
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::default()),
            release_hook: Mutex::new(None),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.options.max_workers
    }

    pub fn default_task(&self) -> Option<&str> {
        self.options.default_task.as_deref()
    }

    pub fn set_release_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.release_hook) = Some(Arc::new(hook));
    }

    /// True while another worker can be acquired without exceeding capacity.
    pub fn has_available_worker(&self) -> bool {
        self.count_available_workers() > 0
    }

    /// Idle workers plus capacity not yet spawned.
    pub fn count_available_workers(&self) -> usize {
        let state = lock(&self.state);
        if state.closed {
            return 0;
        }
        self.options
            .max_workers
            .saturating_sub(state.active_count())
    }

    pub fn has_active_workers(&self) -> bool {
        self.active_count() > 0
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active_count()
    }

    /// Live worker threads, idle or busy.
    pub fn live_count(&self) -> usize {
        let state = lock(&self.state);
        state.slots.len() + state.pending_spawns
    }

    pub fn worker_state(&self, worker: WorkerId) -> Option<WorkerState> {
        lock(&self.state).slots.get(&worker).map(|slot| slot.state)
    }

    /// Acquires a worker loaded with `pointer` (or the pool default).
    ///
    /// Returns `Ok(None)` when the pool is at capacity or shuts down before the
    /// worker is ready. A worker whose setup or load fails is terminated and the
    /// error returned.
    pub async fn get_worker(
        &self,
        pointer: Option<&str>,
    ) -> Result<Option<WorkerHandle>, WorkerPoolError> {
        let pointer = self.resolve_pointer(pointer)?;

        let acquired = {
            let mut state = lock(&self.state);
            if state.closed {
                tracing::debug!("worker requested after pool shutdown");
                return Ok(None);
            }
            if let Some(id) = state.available.pop_front() {
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.state = WorkerState::Loading;
                }
                Acquired::Reused(id)
            } else if state.active_count() < self.options.max_workers {
                state.pending_spawns += 1;
                Acquired::Spawn(self.next_id.fetch_add(1, Ordering::Relaxed))
            } else {
                return Ok(None);
            }
        };

        let id = match acquired {
            Acquired::Reused(id) => id,
            Acquired::Spawn(id) => {
                if !self.spawn_and_setup(id).await? {
                    return Ok(None);
                }
                id
            }
        };

        if let Err(err) = self
            .round_trip(id, WorkerCommand::Load(pointer.clone()), LifecycleStage::Load)
            .await
        {
            self.terminate(id);
            if self.is_closed() {
                tracing::debug!(worker = id, "pool shut down while worker was loading");
                return Ok(None);
            }
            tracing::warn!(worker = id, pointer = %pointer, error = %err, "worker load failed");
            return Err(err);
        }

        if !self.activate(id, &pointer) {
            self.terminate(id);
            tracing::debug!(worker = id, "pool shut down while worker was loading");
            return Ok(None);
        }
        tracing::debug!(worker = id, pointer = %pointer, "worker acquired");
        Ok(Some(WorkerHandle { id, pointer }))
    }

    /// Dispatches one payload to an acquired worker.
    ///
    /// The returned [`TaskRun`] yields progress events followed by exactly one
    /// terminal event.
    pub async fn run(&self, worker: WorkerId, payload: Value) -> Result<TaskRun, WorkerPoolError> {
        let (commands, messages) = {
            let state = lock(&self.state);
            let slot = state
                .slots
                .get(&worker)
                .ok_or(WorkerPoolError::UnknownWorker { worker })?;
            if slot.state != WorkerState::Active {
                return Err(WorkerPoolError::InvalidState {
                    worker,
                    state: slot.state,
                });
            }
            (slot.commands.clone(), slot.messages.clone())
        };

        let events = messages
            .try_lock_owned()
            .map_err(|_| WorkerPoolError::Busy { worker })?;
        commands
            .send(WorkerCommand::Run(payload))
            .map_err(|_| WorkerPoolError::WorkerGone { worker })?;
        self.telemetry.record_dispatched_task();

        Ok(TaskRun {
            worker,
            events,
            finished: false,
        })
    }

    /// Disposes the worker's task, returns it to the available set, then calls
    /// the release hook. A worker whose dispose fails is terminated instead.
    pub async fn release_worker(&self, worker: WorkerId) -> Result<(), WorkerPoolError> {
        {
            let mut state = lock(&self.state);
            let slot = state
                .slots
                .get_mut(&worker)
                .ok_or(WorkerPoolError::UnknownWorker { worker })?;
            if slot.state != WorkerState::Active {
                return Err(WorkerPoolError::InvalidState {
                    worker,
                    state: slot.state,
                });
            }
            slot.state = WorkerState::Disposing;
        }

        let result = self
            .round_trip(worker, WorkerCommand::Dispose, LifecycleStage::Dispose)
            .await;

        match &result {
            Ok(()) => {
                let mut state = lock(&self.state);
                if let Some(slot) = state.slots.get_mut(&worker) {
                    slot.state = WorkerState::Idle;
                    slot.pointer = None;
                    state.available.push_back(worker);
                }
            }
            Err(err) => {
                tracing::warn!(worker, error = %err, "worker dispose failed; terminating");
                self.terminate(worker);
            }
        }

        self.fire_release_hook();
        result
    }

    /// Hard-terminates a worker, aborting any task it is running.
    pub fn remove_worker(&self, worker: WorkerId) -> Result<(), WorkerPoolError> {
        if !self.terminate(worker) {
            return Err(WorkerPoolError::UnknownWorker { worker });
        }
        Ok(())
    }

    /// Terminates every worker and joins their threads, waiting at most
    /// `lifecycle_timeout` in total.
    pub async fn shutdown(&self) {
        let slots: Vec<(WorkerId, WorkerSlot)> = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.available.clear();
            state.slots.drain().collect()
        };
        self.telemetry.record_worker_pool_size(0);

        let mut threads = Vec::with_capacity(slots.len());
        for (id, mut slot) in slots {
            slot.kill.cancel();
            let _ = slot.commands.send(WorkerCommand::Terminate);
            if let Some(thread) = slot.thread.take() {
                threads.push((id, thread));
            }
        }

        let count = threads.len();
        let join_all = tokio::task::spawn_blocking(move || {
            for (id, thread) in threads {
                if thread.join().is_err() {
                    tracing::warn!(worker = id, "worker thread panicked during shutdown");
                }
            }
        });

        match tokio::time::timeout(self.options.lifecycle_timeout, join_all).await {
            Ok(Ok(())) => tracing::info!(workers = count, "worker pool shut down"),
            Ok(Err(err)) => tracing::warn!(error = %err, "worker join task failed"),
            Err(_) => tracing::warn!(
                workers = count,
                timeout = ?self.options.lifecycle_timeout,
                "worker threads did not exit in time; detaching"
            ),
        }
    }

    fn resolve_pointer(&self, requested: Option<&str>) -> Result<String, WorkerPoolError> {
        match (&self.options.default_task, requested) {
            (None, None) => Err(WorkerPoolError::MissingTaskPointer),
            (Some(default), Some(requested)) if requested != default => {
                Err(WorkerPoolError::PointerMismatch {
                    default: default.clone(),
                    requested: requested.to_owned(),
                })
            }
            (Some(default), _) => Ok(default.clone()),
            (None, Some(requested)) => Ok(requested.to_owned()),
        }
    }

    /// Spawns and sets up a worker. Returns `Ok(false)` when the pool shut down
    /// in the meantime; the new thread is then told to exit and left detached.
    async fn spawn_and_setup(&self, id: WorkerId) -> Result<bool, WorkerPoolError> {
        let spawned = match spawn_worker(id, self.registry.clone()) {
            Ok(spawned) => spawned,
            Err(err) => {
                lock(&self.state).pending_spawns -= 1;
                tracing::error!(worker = id, error = %err, "failed to spawn worker");
                return Err(err);
            }
        };

        let live = {
            let mut state = lock(&self.state);
            state.pending_spawns -= 1;
            if state.closed {
                drop(state);
                spawned.kill.cancel();
                let _ = spawned.commands.send(WorkerCommand::Terminate);
                tracing::debug!(worker = id, "pool shut down during spawn; discarding worker");
                return Ok(false);
            }
            state.slots.insert(
                id,
                WorkerSlot {
                    state: WorkerState::SetupPending,
                    pointer: None,
                    commands: spawned.commands,
                    messages: Arc::new(AsyncMutex::new(spawned.messages)),
                    kill: spawned.kill,
                    thread: Some(spawned.thread),
                },
            );
            state.slots.len()
        };
        self.telemetry.record_worker_pool_size(live);

        let shared = self.options.shared_data.clone();
        if let Err(err) = self
            .round_trip(id, WorkerCommand::Setup(shared), LifecycleStage::Setup)
            .await
        {
            self.terminate(id);
            if self.is_closed() {
                tracing::debug!(worker = id, "pool shut down during worker setup");
                return Ok(false);
            }
            tracing::warn!(worker = id, error = %err, "worker setup failed");
            return Err(err);
        }

        self.set_state(id, WorkerState::Loading);
        tracing::debug!(worker = id, "worker spawned and set up");
        Ok(true)
    }

    /// Sends a lifecycle command and waits for its acknowledgement.
    async fn round_trip(
        &self,
        worker: WorkerId,
        command: WorkerCommand,
        stage: LifecycleStage,
    ) -> Result<(), WorkerPoolError> {
        let (commands, messages) = {
            let state = lock(&self.state);
            let slot = state
                .slots
                .get(&worker)
                .ok_or(WorkerPoolError::UnknownWorker { worker })?;
            (slot.commands.clone(), slot.messages.clone())
        };

        commands
            .send(command)
            .map_err(|_| WorkerPoolError::WorkerGone { worker })?;

        let wait = async {
            let mut receiver = messages.lock().await;
            loop {
                match receiver.recv().await {
                    None => return Err(WorkerPoolError::WorkerGone { worker }),
                    Some(message) if message.acknowledges(stage) => return Ok(()),
                    Some(WorkerMessage::LifecycleFailed { stage, error }) => {
                        return Err(WorkerPoolError::Lifecycle {
                            worker,
                            stage,
                            reason: error,
                        })
                    }
                    Some(other) => {
                        tracing::debug!(worker, message = ?other, "discarding message while awaiting {stage}");
                    }
                }
            }
        };

        match tokio::time::timeout(self.options.lifecycle_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(WorkerPoolError::Lifecycle {
                worker,
                stage,
                reason: format!(
                    "no acknowledgement within {:?}",
                    self.options.lifecycle_timeout
                ),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Marks a loaded worker Active. False when shutdown already took its slot.
    fn activate(&self, worker: WorkerId, pointer: &str) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        match state.slots.get_mut(&worker) {
            Some(slot) => {
                slot.state = WorkerState::Active;
                slot.pointer = Some(pointer.to_owned());
                true
            }
            None => false,
        }
    }

    fn set_state(&self, worker: WorkerId, next: WorkerState) {
        if let Some(slot) = lock(&self.state).slots.get_mut(&worker) {
            slot.state = next;
        }
    }

    /// Removes the worker from the pool and stops its thread without joining it.
    fn terminate(&self, worker: WorkerId) -> bool {
        let (mut slot, live) = {
            let mut state = lock(&self.state);
            let Some(slot) = state.slots.remove(&worker) else {
                return false;
            };
            state.available.retain(|id| *id != worker);
            (slot, state.slots.len())
        };
        self.telemetry.record_worker_pool_size(live);

        slot.kill.cancel();
        let _ = slot.commands.send(WorkerCommand::Terminate);
        drop(slot.thread.take());
        tracing::debug!(worker, previous = ?slot.state, pointer = ?slot.pointer, "worker terminated");
        true
    }

    fn fire_release_hook(&self) {
        let hook = lock(&self.release_hook).clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in state.slots.values() {
            slot.kill.cancel();
        }
    }
}

/// Event stream of one dispatched task.
#[derive(Debug)]
pub struct TaskRun {
    worker: WorkerId,
    events: OwnedMutexGuard<mpsc::UnboundedReceiver<WorkerMessage>>,
    finished: bool,
}

impl TaskRun {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Next progress or terminal event; `None` after the terminal event.
    ///
    /// A worker that exits before reporting yields a synthetic `Rejected`.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.events.recv().await {
                Some(WorkerMessage::Progress(value)) => return Some(TaskEvent::Progress(value)),
                Some(WorkerMessage::Resolved(value)) => {
                    self.finished = true;
                    return Some(TaskEvent::Resolved(value));
                }
                Some(WorkerMessage::Rejected(error)) => {
                    self.finished = true;
                    return Some(TaskEvent::Rejected(error));
                }
                Some(other) => {
                    tracing::debug!(worker = self.worker, message = ?other, "ignoring lifecycle message during run");
                }
                None => {
                    self.finished = true;
                    return Some(TaskEvent::Rejected(format!(
                        "worker {} exited before reporting a result",
                        self.worker
                    )));
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
