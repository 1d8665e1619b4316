use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use blockrange::{
    block_range_service, BlockRangeService, ProgressSender, ScanConfig, ScanConfigBuilder,
    ScanMode, ScanProgress, ScanStore, ScanTaskPayload, TaskRegistry, WorkerTask,
};
use futures::future::LocalBoxFuture;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

pub const RECORD_TASK: &str = "record";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Shared log of every block scanned by [`RecordingTask`] instances.
#[derive(Default)]
pub struct ScanRecorder {
    blocks: Mutex<Vec<u64>>,
    starts: Mutex<Vec<u64>>,
    failures_left: AtomicUsize,
}

impl ScanRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rejects the first `failures` runs before scanning anything.
    pub fn failing_first(failures: usize) -> Arc<Self> {
        let recorder = Self::default();
        recorder.failures_left.store(failures, Ordering::SeqCst);
        Arc::new(recorder)
    }

    pub fn blocks(&self) -> Vec<u64> {
        let mut blocks = self.blocks.lock().unwrap().clone();
        blocks.sort_unstable();
        blocks
    }

    pub fn starts(&self) -> Vec<u64> {
        let mut starts = self.starts.lock().unwrap().clone();
        starts.sort_unstable();
        starts
    }

    pub fn registry(self: &Arc<Self>) -> TaskRegistry {
        let recorder = self.clone();
        TaskRegistry::new().with_task(RECORD_TASK, move |_| {
            Ok(Box::new(RecordingTask {
                recorder: recorder.clone(),
            }) as Box<dyn WorkerTask>)
        })
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Scans a payload block by block, reporting progress after each one.
pub struct RecordingTask {
    recorder: Arc<ScanRecorder>,
}

impl WorkerTask for RecordingTask {
    fn run(&mut self, payload: Value, progress: ProgressSender) -> LocalBoxFuture<'_, Result<Value>> {
        let recorder = self.recorder.clone();
        Box::pin(async move {
            let payload = ScanTaskPayload::from_value(payload)?;
            recorder.starts.lock().unwrap().push(payload.start_block);
            if recorder.take_failure() {
                return Err(anyhow!("transient failure at block {}", payload.start_block));
            }

            for block in payload.blocks() {
                recorder.blocks.lock().unwrap().push(block);
                progress.report(&ScanProgress {
                    block_number: block,
                })?;
            }
            Ok(json!({ "scanned": payload.end_block - payload.start_block }))
        })
    }
}

pub fn test_config() -> ScanConfigBuilder {
    ScanConfig::builder()
        .thread_count(2)
        .reserved_threads(0)
        .max_chunk_size(4)
        .task_pointer(RECORD_TASK)
        .poll_interval(Duration::from_millis(50))
        .metrics_interval(Duration::from_millis(200))
}

pub fn build_service(
    mode: ScanMode,
    config: ScanConfig,
    store: Arc<dyn ScanStore>,
    recorder: &Arc<ScanRecorder>,
) -> Result<Arc<BlockRangeService>> {
    Ok(Arc::new(block_range_service(
        mode,
        config,
        store,
        recorder.registry(),
    )?))
}

pub async fn wait_for_scan_complete(
    service: &BlockRangeService,
    scan_key: &str,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if !service.scanner().has_unscanned_blocks(scan_key, None).await {
            return Ok(());
        }

        if start.elapsed() > timeout {
            bail!(
                "scan {scan_key} did not complete within {:?} (telemetry: {:?})",
                timeout,
                service.telemetry().snapshot()
            );
        }

        sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_idle_pool(service: &BlockRangeService, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if !service.pool().has_active_workers() && service.scheduler().inflight().is_empty() {
            return Ok(());
        }

        if start.elapsed() > timeout {
            bail!(
                "worker pool still busy after {:?} (active: {})",
                timeout,
                service.pool().active_count()
            );
        }

        sleep(Duration::from_millis(25)).await;
    }
}

pub fn assert_each_block_once(blocks: &[u64], end: u64) {
    let expected: Vec<u64> = (0..end).collect();
    assert_eq!(blocks, expected.as_slice(), "every block must be scanned exactly once");
}
