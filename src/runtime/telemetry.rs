use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters shared by the repository, the pool and the scheduler.
#[derive(Default, Debug)]
pub struct Telemetry {
    claimed_nodes: AtomicU64,
    dispatched_tasks: AtomicU64,
    resolved_tasks: AtomicU64,
    rejected_tasks: AtomicU64,
    progress_updates: AtomicU64,
    store_errors: AtomicU64,
    worker_pool_transitions: AtomicU64,
    worker_pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_claimed_node(&self) {
        self.claimed_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched_task(&self) {
        self.dispatched_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved_task(&self) {
        self.resolved_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_task(&self) {
        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_progress_update(&self) {
        self.progress_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_pool_size(&self, workers: usize) {
        self.worker_pool_size.store(workers, Ordering::Relaxed);
        self.worker_pool_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.load(Ordering::Relaxed)
    }

    pub fn worker_pool_transitions(&self) -> u64 {
        self.worker_pool_transitions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            claimed_nodes: self.claimed_nodes.load(Ordering::Relaxed),
            dispatched_tasks: self.dispatched_tasks.load(Ordering::Relaxed),
            resolved_tasks: self.resolved_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
            progress_updates: self.progress_updates.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            worker_pool_size: self.worker_pool_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub claimed_nodes: u64,
    pub dispatched_tasks: u64,
    pub resolved_tasks: u64,
    pub rejected_tasks: u64,
    pub progress_updates: u64,
    pub store_errors: u64,
    pub worker_pool_size: usize,
}

/// Spawns a background task that periodically logs claim throughput, task
/// outcomes, and store errors.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "blockrange::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let claimed_delta = current
                        .claimed_nodes
                        .saturating_sub(last_snapshot.claimed_nodes);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let claim_rate = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        claimed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "blockrange::metrics",
                        claim_rate = format!("{claim_rate:.2}"),
                        claimed = current.claimed_nodes,
                        dispatched = current.dispatched_tasks,
                        resolved = current.resolved_tasks,
                        rejected = current.rejected_tasks,
                        progress_updates = current.progress_updates,
                        store_errors = current.store_errors,
                        workers = current.worker_pool_size,
                        "scan metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
