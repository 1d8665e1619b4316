//! Explicit construction of one block range scanning service per mode.

use super::scheduler::{RejectedScan, ReplayScheduler, ScanMode};
use crate::pool::{host_threads, worker_max_count, TaskRegistry, WorkerPool, WorkerPoolOptions};
use crate::runtime::config::ScanConfig;
use crate::runtime::telemetry::Telemetry;
use crate::scanner::BlockRangeScanner;
use crate::store::{MemoryScanStore, ScanError, ScanRepository, ScanStore};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Scanner, worker pool and scheduler wired for one [`ScanMode`].
///
/// Build one with [`block_range_service`]; each call yields an independent
/// service, so callers decide how many exist and who owns them.
pub struct BlockRangeService {
    mode: ScanMode,
    config: ScanConfig,
    scanner: Arc<BlockRangeScanner>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<ReplayScheduler>,
    telemetry: Arc<Telemetry>,
}

/// Builds the scanner over `store`, a pool sized from `config` and the host,
/// and a scheduler bound to `mode`.
pub fn block_range_service(
    mode: ScanMode,
    config: ScanConfig,
    store: Arc<dyn ScanStore>,
    tasks: TaskRegistry,
) -> Result<BlockRangeService> {
    config.validate()?;
    let telemetry = Arc::new(Telemetry::default());

    let partitioner = config
        .partitioner()
        .context("invalid partitioner configuration")?;
    let repository = ScanRepository::new(
        store,
        partitioner,
        config.claim_stale_after(),
        telemetry.clone(),
    );
    let scanner = Arc::new(BlockRangeScanner::new(repository));

    if let Some(pointer) = config.task_pointer() {
        if !tasks.contains(pointer) {
            anyhow::bail!("task_pointer {pointer} is not registered");
        }
    }

    let max_workers = worker_max_count(
        config.thread_count(),
        host_threads(),
        config.reserved_threads(),
    );
    let shared_data = json!({
        "mode": mode,
        "max_chunk_size": config.max_chunk_size(),
        "max_workers": max_workers,
    });
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolOptions {
            max_workers,
            default_task: config.task_pointer().map(str::to_owned),
            shared_data: Arc::new(shared_data),
            lifecycle_timeout: config.lifecycle_timeout(),
        },
        Arc::new(tasks),
        telemetry.clone(),
    ));

    let scheduler = ReplayScheduler::new(
        mode,
        scanner.clone(),
        pool.clone(),
        config.task_pointer().map(str::to_owned),
        telemetry.clone(),
    );

    tracing::info!(
        %mode,
        max_workers,
        requested_threads = config.thread_count(),
        max_chunk_size = config.max_chunk_size(),
        "block range service ready"
    );

    Ok(BlockRangeService {
        mode,
        config,
        scanner,
        pool,
        scheduler,
        telemetry,
    })
}

impl BlockRangeService {
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn scanner(&self) -> &Arc<BlockRangeScanner> {
        &self.scanner
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<ReplayScheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub async fn create_scan(&self, scan_key: &str, start: u64, end: u64) -> Result<(), ScanError> {
        self.scanner.create_scan(scan_key, start, end).await
    }

    pub async fn next(&self, scan_key: Option<&str>) {
        self.scheduler.next(scan_key).await
    }

    /// Returns a receiver of every rejected leaf from now on.
    pub fn rejections(&self) -> mpsc::UnboundedReceiver<RejectedScan> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scheduler.set_rejection_sink(tx);
        rx
    }

    /// Stops every worker; in-flight leaves are recovered later through the
    /// staleness window.
    pub async fn shutdown(&self) {
        tracing::info!(mode = %self.mode, in_flight = self.scheduler.inflight().len(), "shutting down block range service");
        self.pool.shutdown().await;
    }
}

/// Opens the store named by `database_url`, or an in-memory store when unset.
pub async fn open_store(config: &ScanConfig) -> Result<Arc<dyn ScanStore>> {
    match config.database_url() {
        Some(url) => connect_postgres(url, config.thread_count()).await,
        None => Ok(Arc::new(MemoryScanStore::new())),
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str, threads: usize) -> Result<Arc<dyn ScanStore>> {
    let max_connections = u32::try_from(threads.saturating_add(1)).unwrap_or(u32::MAX);
    let store = crate::store::PostgresScanStore::connect(url, max_connections).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str, _threads: usize) -> Result<Arc<dyn ScanStore>> {
    anyhow::bail!("database_url is set but blockrange was built without the `postgres` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ProgressSender, WorkerTask};
    use futures::future::LocalBoxFuture;
    use serde_json::Value;
    use std::time::Duration;

    struct Noop;

    impl WorkerTask for Noop {
        fn run(&mut self, _payload: Value, _progress: ProgressSender) -> LocalBoxFuture<'_, Result<Value>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    fn config(pointer: &str) -> ScanConfig {
        ScanConfig::builder()
            .thread_count(2)
            .reserved_threads(0)
            .max_chunk_size(4)
            .task_pointer(pointer)
            .poll_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn tasks() -> TaskRegistry {
        TaskRegistry::new().with_task("noop", |_| Ok(Box::new(Noop) as Box<dyn WorkerTask>))
    }

    #[tokio::test]
    async fn services_are_independent_per_mode() {
        let replay = block_range_service(
            ScanMode::Replay,
            config("noop"),
            Arc::new(MemoryScanStore::new()),
            tasks(),
        )
        .unwrap();
        let default = block_range_service(
            ScanMode::Default,
            config("noop"),
            Arc::new(MemoryScanStore::new()),
            tasks(),
        )
        .unwrap();

        replay.create_scan("k", 0, 10).await.unwrap();
        assert!(replay.scanner().has_scan_key("k", None).await);
        assert!(!default.scanner().has_scan_key("k", None).await);
        assert_eq!(replay.scheduler().mode(), ScanMode::Replay);
        assert_eq!(default.mode(), ScanMode::Default);
        assert!(replay.pool().max_workers() >= 1);
        assert_eq!(replay.pool().default_task(), Some("noop"));
    }

    #[test]
    fn unknown_task_pointer_is_rejected() {
        let err = block_range_service(
            ScanMode::Default,
            config("missing"),
            Arc::new(MemoryScanStore::new()),
            tasks(),
        )
        .err()
        .expect("unregistered pointer");
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn open_store_defaults_to_memory() {
        let store = open_store(&config("noop")).await.unwrap();
        assert!(!store
            .has_nodes(&crate::store::ScanFilter::key("k"))
            .await
            .unwrap());
    }
}
