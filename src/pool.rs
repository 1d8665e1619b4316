//! Bounded pool of OS-thread workers split across focused submodules:
//! - `types`: command/message enums, lifecycle states and pool errors
//! - `registry`: startup-time map from task pointers to task factories
//! - `process`: the worker thread main loop
//! - `worker_pool`: acquisition, dispatch, release and shutdown
//! - `tests`: pool lifecycle tests

mod process;
mod registry;
mod types;
mod worker_pool;


pub use registry::{ProgressSender, SharedData, TaskFactory, TaskRegistry, WorkerTask};
pub use types::{
    LifecycleStage, TaskEvent, WorkerCommand, WorkerId, WorkerMessage, WorkerPoolError,
    WorkerState,
};
pub use worker_pool::{
    host_threads, worker_max_count, ReleaseHook, TaskRun, WorkerHandle, WorkerPool,
    WorkerPoolOptions,
};
