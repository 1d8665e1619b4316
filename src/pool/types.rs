use super::registry::SharedData;
use serde_json::Value;
use std::fmt;

pub type WorkerId = u64;

/// Commands sent from the pool to a worker thread.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Setup(SharedData),
    Load(String),
    Run(Value),
    Dispose,
    Terminate,
}

/// Messages streamed back from a worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    SetupComplete,
    LoadComplete,
    DisposeComplete,
    LifecycleFailed { stage: LifecycleStage, error: String },
    Progress(Value),
    Resolved(Value),
    Rejected(String),
}

impl WorkerMessage {
    pub(super) fn acknowledges(&self, stage: LifecycleStage) -> bool {
        matches!(
            (self, stage),
            (WorkerMessage::SetupComplete, LifecycleStage::Setup)
                | (WorkerMessage::LoadComplete, LifecycleStage::Load)
                | (WorkerMessage::DisposeComplete, LifecycleStage::Dispose)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    Setup,
    Load,
    Dispose,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStage::Setup => "setup",
            LifecycleStage::Load => "load",
            LifecycleStage::Dispose => "dispose",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Created,
    SetupPending,
    Idle,
    Loading,
    Active,
    Disposing,
    Terminated,
}

/// Events observed by the caller of [`super::WorkerPool::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(Value),
    Resolved(Value),
    Rejected(String),
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Progress(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerPoolError {
    /// No pool-wide default task and no pointer supplied.
    MissingTaskPointer,
    /// The pool is homogeneous and a different pointer was requested.
    PointerMismatch { default: String, requested: String },
    Lifecycle {
        worker: WorkerId,
        stage: LifecycleStage,
        reason: String,
    },
    WorkerGone { worker: WorkerId },
    UnknownWorker { worker: WorkerId },
    InvalidState { worker: WorkerId, state: WorkerState },
    Busy { worker: WorkerId },
    Spawn(String),
}

impl fmt::Display for WorkerPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPoolError::MissingTaskPointer => {
                write!(f, "no task pointer supplied and no default task configured")
            }
            WorkerPoolError::PointerMismatch { default, requested } => write!(
                f,
                "pool runs task {default}; cannot load requested task {requested}"
            ),
            WorkerPoolError::Lifecycle {
                worker,
                stage,
                reason,
            } => write!(f, "worker {worker} {stage} failed: {reason}"),
            WorkerPoolError::WorkerGone { worker } => {
                write!(f, "worker {worker} exited unexpectedly")
            }
            WorkerPoolError::UnknownWorker { worker } => write!(f, "unknown worker {worker}"),
            WorkerPoolError::InvalidState { worker, state } => {
                write!(f, "worker {worker} is {state:?}")
            }
            WorkerPoolError::Busy { worker } => {
                write!(f, "worker {worker} is already running a task")
            }
            WorkerPoolError::Spawn(reason) => write!(f, "failed to spawn worker thread: {reason}"),
        }
    }
}

impl std::error::Error for WorkerPoolError {}
