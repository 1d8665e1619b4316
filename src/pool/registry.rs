use super::types::WorkerMessage;
use anyhow::{anyhow, Result};
use futures::future::LocalBoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Immutable context handed to every worker during setup.
pub type SharedData = Arc<Value>;

/// Builds a task instance inside the worker thread that will run it.
pub type TaskFactory = Arc<dyn Fn(&SharedData) -> Result<Box<dyn WorkerTask>> + Send + Sync>;

/// Unit of work bound to a worker by `load` and released by `dispose`.
///
/// Tasks are created and driven on the worker's own thread, so they need not
/// be `Send`.
pub trait WorkerTask {
    fn run(&mut self, payload: Value, progress: ProgressSender)
        -> LocalBoxFuture<'_, Result<Value>>;

    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Streams non-terminal progress messages back to the pool.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ProgressSender {
    pub(super) fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the pool stopped listening.
    pub fn send(&self, value: Value) -> bool {
        self.tx.send(WorkerMessage::Progress(value)).is_ok()
    }

    pub fn report<T: Serialize>(&self, value: &T) -> Result<bool> {
        Ok(self.send(serde_json::to_value(value)?))
    }
}

/// Maps task pointers to factories. Populated at startup; workers resolve
/// pointers against it during `load`.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pointer: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&SharedData) -> Result<Box<dyn WorkerTask>> + Send + Sync + 'static,
    {
        self.factories.insert(pointer.into(), Arc::new(factory));
        self
    }

    pub fn with_task<F>(mut self, pointer: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&SharedData) -> Result<Box<dyn WorkerTask>> + Send + Sync + 'static,
    {
        self.register(pointer, factory);
        self
    }

    pub fn contains(&self, pointer: &str) -> bool {
        self.factories.contains_key(pointer)
    }

    pub fn pointers(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub(super) fn instantiate(
        &self,
        pointer: &str,
        shared: &SharedData,
    ) -> Result<Box<dyn WorkerTask>> {
        let factory = self
            .factories
            .get(pointer)
            .ok_or_else(|| anyhow!("no task registered under pointer {pointer}"))?;
        factory(shared)
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("pointers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
