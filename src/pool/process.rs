use super::registry::{ProgressSender, SharedData, TaskRegistry, WorkerTask};
use super::types::{LifecycleStage, WorkerCommand, WorkerId, WorkerMessage, WorkerPoolError};
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(super) struct SpawnedWorker {
    pub(super) commands: mpsc::UnboundedSender<WorkerCommand>,
    pub(super) messages: mpsc::UnboundedReceiver<WorkerMessage>,
    pub(super) kill: CancellationToken,
    pub(super) thread: JoinHandle<()>,
}

/// Starts a named OS thread running one worker on its own current-thread runtime.
pub(super) fn spawn_worker(
    id: WorkerId,
    registry: Arc<TaskRegistry>,
) -> Result<SpawnedWorker, WorkerPoolError> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let process = WorkerProcess {
        id,
        registry,
        commands: command_rx,
        messages: message_tx,
        kill: kill.clone(),
    };

    let thread = std::thread::Builder::new()
        .name(format!("blockrange-worker-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(worker = id, error = %err, "failed to build worker runtime");
                    return;
                }
            };
            runtime.block_on(process.run());
        })
        .map_err(|err| WorkerPoolError::Spawn(err.to_string()))?;

    Ok(SpawnedWorker {
        commands: command_tx,
        messages: message_rx,
        kill,
        thread,
    })
}

struct WorkerProcess {
    id: WorkerId,
    registry: Arc<TaskRegistry>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    kill: CancellationToken,
}

impl WorkerProcess {
    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    async fn run(mut self) {
        tracing::debug!("worker thread started");

        let mut shared: Option<SharedData> = None;
        let mut task: Option<Box<dyn WorkerTask>> = None;

        loop {
            let command = tokio::select! {
                _ = self.kill.cancelled() => break,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else {
                break;
            };

            match command {
                WorkerCommand::Setup(data) => {
                    shared = Some(data);
                    self.send(WorkerMessage::SetupComplete);
                }
                WorkerCommand::Load(pointer) => {
                    let Some(data) = shared.as_ref() else {
                        self.lifecycle_failed(LifecycleStage::Load, "worker has not been set up");
                        continue;
                    };
                    match self.instantiate(&pointer, data) {
                        Ok(instance) => {
                            task = Some(instance);
                            tracing::debug!(pointer = %pointer, "task loaded");
                            self.send(WorkerMessage::LoadComplete);
                        }
                        Err(reason) => self.lifecycle_failed(LifecycleStage::Load, &reason),
                    }
                }
                WorkerCommand::Run(payload) => {
                    let Some(instance) = task.as_mut() else {
                        self.send(WorkerMessage::Rejected("no task loaded".to_string()));
                        continue;
                    };
                    let progress = ProgressSender::new(self.messages.clone());
                    let run = AssertUnwindSafe(async { instance.run(payload, progress).await });
                    let outcome = tokio::select! {
                        outcome = run.catch_unwind() => outcome,
                        _ = self.kill.cancelled() => {
                            self.send(WorkerMessage::Rejected("worker terminated while running".to_string()));
                            break;
                        }
                    };
                    let message = match outcome {
                        Ok(Ok(value)) => WorkerMessage::Resolved(value),
                        Ok(Err(err)) => WorkerMessage::Rejected(format!("{err:#}")),
                        Err(panic_payload) => {
                            let panic_msg = panic_message(panic_payload.as_ref());
                            tracing::error!(panic = %panic_msg, "task panicked");
                            WorkerMessage::Rejected(format!("task panicked: {panic_msg}"))
                        }
                    };
                    self.send(message);
                }
                WorkerCommand::Dispose => {
                    let result = match task.take() {
                        Some(mut instance) => {
                            match panic::catch_unwind(AssertUnwindSafe(|| instance.dispose())) {
                                Ok(Ok(())) => Ok(()),
                                Ok(Err(err)) => Err(format!("{err:#}")),
                                Err(panic_payload) => Err(format!(
                                    "dispose panicked: {}",
                                    panic_message(panic_payload.as_ref())
                                )),
                            }
                        }
                        None => Ok(()),
                    };
                    match result {
                        Ok(()) => self.send(WorkerMessage::DisposeComplete),
                        Err(reason) => self.lifecycle_failed(LifecycleStage::Dispose, &reason),
                    }
                }
                WorkerCommand::Terminate => break,
            }
        }

        tracing::debug!("worker thread exited");
    }

    fn instantiate(&self, pointer: &str, shared: &SharedData) -> Result<Box<dyn WorkerTask>, String> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.registry.instantiate(pointer, shared))) {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic_payload) => Err(format!(
                "task factory panicked: {}",
                panic_message(panic_payload.as_ref())
            )),
        }
    }

    fn lifecycle_failed(&self, stage: LifecycleStage, reason: &str) {
        tracing::warn!(%stage, error = reason, "worker lifecycle step failed");
        self.send(WorkerMessage::LifecycleFailed {
            stage,
            error: reason.to_string(),
        });
    }

    fn send(&self, message: WorkerMessage) {
        if self.messages.send(message).is_err() {
            tracing::debug!("pool dropped the message channel");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
