//! Level-triggered dispatch loop tying the scanner, the worker pool and the
//! in-flight registry together.
//!
//! `next()` may be called from any number of signals (timer, release hook,
//! broadcast message); only one pass runs at a time and every pass re-reads
//! pool capacity and scanner state instead of trusting cached counts.

use super::inflight::InFlightRegistry;
use crate::pool::{TaskEvent, TaskRun, WorkerHandle, WorkerPool};
use crate::range::RangeNode;
use crate::runtime::telemetry::Telemetry;
use crate::scanner::BlockRangeScanner;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Default,
    Replay,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Default => f.write_str("default"),
            ScanMode::Replay => f.write_str("replay"),
        }
    }
}

/// Payload handed to a worker for one claimed leaf.
///
/// `start_block` is the leaf's resume point, so a re-claimed leaf skips the
/// blocks already confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTaskPayload {
    pub start_block: u64,
    pub end_block: u64,
    pub scan_key: String,
    pub mode: ScanMode,
}

impl ScanTaskPayload {
    pub fn for_node(node: &RangeNode, mode: ScanMode) -> Self {
        Self {
            start_block: node.resume_from(),
            end_block: node.end(),
            scan_key: node.scan_key().to_owned(),
            mode,
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("invalid scan task payload")
    }

    pub fn blocks(&self) -> std::ops::Range<u64> {
        self.start_block..self.end_block
    }
}

/// Progress message a task streams after confirming `block_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub block_number: u64,
}

/// A leaf whose task was rejected, for retry or stash handling downstream.
#[derive(Debug, Clone)]
pub struct RejectedScan {
    pub node: RangeNode,
    pub mode: ScanMode,
    pub error: String,
}

pub struct ReplayScheduler {
    mode: ScanMode,
    scanner: Arc<BlockRangeScanner>,
    pool: Arc<WorkerPool>,
    inflight: InFlightRegistry,
    task_pointer: Option<String>,
    telemetry: Arc<Telemetry>,
    idle: AtomicBool,
    rerun: AtomicBool,
    scan_key: Mutex<Option<String>>,
    rejections: Mutex<Option<mpsc::UnboundedSender<RejectedScan>>>,
}

impl ReplayScheduler {
    /// Builds the scheduler and installs it as the pool's release hook.
    pub fn new(
        mode: ScanMode,
        scanner: Arc<BlockRangeScanner>,
        pool: Arc<WorkerPool>,
        task_pointer: Option<String>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            mode,
            scanner,
            pool,
            inflight: InFlightRegistry::new(),
            task_pointer,
            telemetry,
            idle: AtomicBool::new(true),
            rerun: AtomicBool::new(false),
            scan_key: Mutex::new(None),
            rejections: Mutex::new(None),
        });

        let weak = Arc::downgrade(&scheduler);
        scheduler.pool.set_release_hook(move || {
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { scheduler.next(None).await });
                }
                Err(_) => {
                    tracing::debug!("worker released outside a runtime; waiting for next tick")
                }
            }
        });

        scheduler
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn scan_key(&self) -> Option<String> {
        lock(&self.scan_key).clone()
    }

    pub fn inflight(&self) -> &InFlightRegistry {
        &self.inflight
    }

    /// Routes rejected leaves to `sink` instead of only logging them.
    pub fn set_rejection_sink(&self, sink: mpsc::UnboundedSender<RejectedScan>) {
        *lock(&self.rejections) = Some(sink);
    }

    /// Dispatches claimable leaves until the pool is full or nothing is left.
    ///
    /// A supplied `scan_key` becomes the current target. Calls made while a
    /// pass is running return immediately; the running pass re-checks once
    /// more before going idle so their wakeups are not lost.
    pub async fn next(self: &Arc<Self>, scan_key: Option<&str>) {
        if let Some(key) = scan_key {
            self.adopt_key(key);
        }

        if !self.try_enter() {
            self.rerun.store(true, Ordering::Release);
            return;
        }

        loop {
            self.rerun.store(false, Ordering::Release);
            match self.scan_key() {
                Some(key) => self.dispatch_pass(&key).await,
                None => tracing::trace!("no scan key set; nothing to schedule"),
            }
            self.idle.store(true, Ordering::Release);

            if !self.rerun.swap(false, Ordering::AcqRel) || !self.try_enter() {
                break;
            }
        }
    }

    fn try_enter(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn adopt_key(&self, key: &str) {
        let mut current = lock(&self.scan_key);
        if current.as_deref() != Some(key) {
            tracing::info!(scan_key = key, previous = ?current.as_deref(), mode = %self.mode, "switching scan target");
            *current = Some(key.to_owned());
        }
    }

    async fn dispatch_pass(self: &Arc<Self>, scan_key: &str) {
        let mut dispatched = 0usize;

        while self.pool.has_available_worker()
            && self.scanner.has_unscanned_blocks(scan_key, None).await
        {
            let Some(node) = self.scanner.get_next_scan_node(scan_key).await else {
                tracing::trace!(scan_key, "no claimable scan node");
                break;
            };

            if self.inflight.contains_node(node.hash()) {
                tracing::debug!(
                    scan_key,
                    start = node.start(),
                    end = node.end(),
                    "scan node already in flight; skipping"
                );
                continue;
            }

            match self.dispatch(node).await {
                Ok(true) => dispatched += 1,
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!(scan_key, error = %err, "scan dispatch failed; ending pass");
                    break;
                }
            }
        }

        if dispatched > 0 {
            tracing::debug!(
                scan_key,
                dispatched,
                in_flight = self.inflight.len(),
                "dispatch pass finished"
            );
        }
    }

    /// Returns `Ok(false)` when the pool had no worker for the claimed node;
    /// the claim then lapses through the staleness window.
    async fn dispatch(self: &Arc<Self>, node: RangeNode) -> Result<bool> {
        let worker = match self.pool.get_worker(self.task_pointer.as_deref()).await? {
            Some(worker) => worker,
            None => {
                tracing::debug!(
                    scan_key = node.scan_key(),
                    start = node.start(),
                    "pool filled up after claim; leaving node to stale recovery"
                );
                return Ok(false);
            }
        };

        self.inflight.track(worker.id, node.hash().clone());
        let payload = ScanTaskPayload::for_node(&node, self.mode);

        let run = match self.start_run(&worker, &payload).await {
            Ok(run) => run,
            Err(err) => {
                self.inflight.untrack(worker.id);
                if let Err(release_err) = self.pool.release_worker(worker.id).await {
                    tracing::warn!(worker = worker.id, error = %release_err, "release after failed dispatch failed");
                }
                return Err(err);
            }
        };

        tracing::info!(
            worker = worker.id,
            scan_key = %payload.scan_key,
            start = payload.start_block,
            end = payload.end_block,
            mode = %self.mode,
            "dispatched scan node"
        );

        tokio::spawn(Arc::clone(self).supervise(worker, node, run));
        Ok(true)
    }

    async fn start_run(&self, worker: &WorkerHandle, payload: &ScanTaskPayload) -> Result<TaskRun> {
        let value = serde_json::to_value(payload).context("failed to encode scan task payload")?;
        Ok(self.pool.run(worker.id, value).await?)
    }

    /// Follows one run to its terminal event, then untracks and releases the worker.
    async fn supervise(self: Arc<Self>, worker: WorkerHandle, node: RangeNode, mut run: TaskRun) {
        let scan_key = node.scan_key().to_owned();

        while let Some(event) = run.next_event().await {
            match event {
                TaskEvent::Progress(value) => self.record_progress(&scan_key, value).await,
                TaskEvent::Resolved(_) => {
                    self.telemetry.record_resolved_task();
                    self.scanner.complete_scan_node(&scan_key, &node).await;
                    tracing::info!(
                        worker = worker.id,
                        scan_key = %scan_key,
                        start = node.start(),
                        end = node.end(),
                        "scan node resolved"
                    );
                }
                TaskEvent::Rejected(error) => {
                    self.telemetry.record_rejected_task();
                    tracing::warn!(
                        worker = worker.id,
                        scan_key = %scan_key,
                        start = node.start(),
                        end = node.end(),
                        error = %error,
                        "scan node rejected"
                    );
                    self.forward_rejection(RejectedScan {
                        node: node.clone(),
                        mode: self.mode,
                        error,
                    });
                }
            }
        }

        drop(run);
        self.inflight.untrack(worker.id);
        if let Err(err) = self.pool.release_worker(worker.id).await {
            tracing::warn!(worker = worker.id, error = %err, "failed to release worker");
        }
    }

    async fn record_progress(&self, scan_key: &str, value: Value) {
        match serde_json::from_value::<ScanProgress>(value) {
            Ok(progress) => {
                self.scanner
                    .update_scan_progress(scan_key, progress.block_number)
                    .await
            }
            Err(err) => tracing::trace!(scan_key, error = %err, "ignoring non-progress message"),
        }
    }

    fn forward_rejection(&self, rejected: RejectedScan) {
        let sink = lock(&self.rejections);
        if let Some(sink) = sink.as_ref() {
            if sink.send(rejected).is_err() {
                tracing::debug!("rejection sink closed");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
