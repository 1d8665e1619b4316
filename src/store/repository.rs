use super::{ScanFilter, ScanStore};
use crate::range::{PartitionError, RangeNode, RangePartitioner};
use crate::runtime::telemetry::Telemetry;
use anyhow::Error as AnyError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum ScanError {
    /// A tree already exists for the key; remove it first or pick another key.
    DuplicateScan { scan_key: String },
    InvalidRange(PartitionError),
    Store(AnyError),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::DuplicateScan { scan_key } => {
                write!(f, "a scan tree already exists for key {scan_key}")
            }
            ScanError::InvalidRange(err) => write!(f, "invalid scan range: {err}"),
            ScanError::Store(err) => write!(f, "scan store operation failed: {err}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::DuplicateScan { .. } => None,
            ScanError::InvalidRange(err) => Some(err),
            ScanError::Store(err) => Some(err.as_ref()),
        }
    }
}

impl From<PartitionError> for ScanError {
    fn from(err: PartitionError) -> Self {
        ScanError::InvalidRange(err)
    }
}

/// Claim/progress protocol over a [`ScanStore`].
///
/// Query-style calls never fail: a store error is logged, counted, and
/// reported as "nothing there" so the scheduler idles instead of crashing.
/// Write-style calls (`create_scan_nodes`, `remove_all`) propagate errors.
pub struct ScanRepository {
    store: Arc<dyn ScanStore>,
    partitioner: RangePartitioner,
    claim_stale_after: Duration,
    telemetry: Arc<Telemetry>,
}

impl ScanRepository {
    pub fn new(
        store: Arc<dyn ScanStore>,
        partitioner: RangePartitioner,
        claim_stale_after: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            partitioner,
            claim_stale_after,
            telemetry,
        }
    }

    pub fn partitioner(&self) -> &RangePartitioner {
        &self.partitioner
    }

    pub async fn has_scan_key(&self, scan_key: &str, span: Option<Range<u64>>) -> bool {
        let filter = ScanFilter::key(scan_key).within(span);
        match self.store.has_nodes(&filter).await {
            Ok(found) => found,
            Err(err) => {
                self.store_failed("has_scan_key", scan_key, &err);
                false
            }
        }
    }

    /// Builds the root and its partitioned descendants and inserts them all,
    /// unless the key already has a tree.
    pub async fn create_scan_nodes(
        &self,
        scan_key: &str,
        start: u64,
        end: u64,
    ) -> Result<(), ScanError> {
        let root = RangeNode::root(scan_key, start, end);
        let descendants = self.partitioner.partition(&root)?;

        // A range narrower than one chunk yields a single leaf sharing the root's
        // coordinates; the unique constraint only admits one of them.
        let mut nodes = Vec::with_capacity(descendants.len() + 1);
        if !descendants.iter().any(|node| node.hash() == root.hash()) {
            nodes.push(root);
        }
        nodes.extend(descendants);

        let inserted = self
            .store
            .insert_tree(scan_key, &nodes)
            .await
            .map_err(ScanError::Store)?;
        if !inserted {
            return Err(ScanError::DuplicateScan {
                scan_key: scan_key.to_owned(),
            });
        }

        tracing::info!(
            scan_key,
            start,
            end,
            nodes = nodes.len(),
            max_chunk_size = self.partitioner.max_chunk_size(),
            "created scan tree"
        );
        Ok(())
    }

    /// Atomically claims the next available leaf, or `None` when nothing is claimable.
    pub async fn start_next_scan(&self, scan_key: &str) -> Option<RangeNode> {
        let now = Utc::now();
        let stale_before = self.stale_before(now);
        match self.store.claim_next_leaf(scan_key, stale_before, now).await {
            Ok(Some(node)) => {
                self.telemetry.record_claimed_node();
                tracing::debug!(
                    scan_key,
                    start = node.start(),
                    end = node.end(),
                    processed = ?node.processed_block(),
                    "claimed scan node"
                );
                Some(node)
            }
            Ok(None) => None,
            Err(err) => {
                self.store_failed("start_next_scan", scan_key, &err);
                None
            }
        }
    }

    pub async fn update_scanned_block_number(&self, scan_key: &str, block_number: u64) -> bool {
        match self
            .store
            .record_progress(scan_key, block_number, Utc::now())
            .await
        {
            Ok(updated) => {
                if updated {
                    self.telemetry.record_progress_update();
                }
                updated
            }
            Err(err) => {
                self.store_failed("update_scanned_block_number", scan_key, &err);
                false
            }
        }
    }

    pub async fn complete_scan_node(&self, scan_key: &str, node: &RangeNode) -> bool {
        match self
            .store
            .complete_node(scan_key, node.hash(), Utc::now())
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                self.store_failed("complete_scan_node", scan_key, &err);
                false
            }
        }
    }

    pub async fn has_unscanned_nodes(&self, scan_key: &str, span: Option<Range<u64>>) -> bool {
        let filter = ScanFilter::key(scan_key).within(span);
        match self.store.has_incomplete_leaves(&filter).await {
            Ok(found) => found,
            Err(err) => {
                self.store_failed("has_unscanned_nodes", scan_key, &err);
                false
            }
        }
    }

    /// Number of nodes overlapping `[start, end)`, or `-1` when the store is unreachable.
    pub async fn count_scan_nodes(&self, scan_key: &str, start: u64, end: u64) -> i64 {
        let filter = ScanFilter::key(scan_key).within(Some(start..end));
        match self.store.count_nodes(&filter).await {
            Ok(count) => i64::try_from(count).unwrap_or(i64::MAX),
            Err(err) => {
                self.store_failed("count_scan_nodes", scan_key, &err);
                -1
            }
        }
    }

    pub async fn remove_all(&self, scan_key: &str) -> Result<u64, ScanError> {
        let removed = self
            .store
            .remove_all(scan_key)
            .await
            .map_err(ScanError::Store)?;
        tracing::info!(scan_key, removed, "removed scan tree");
        Ok(removed)
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ChronoDuration::from_std(self.claim_stale_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn store_failed(&self, operation: &'static str, scan_key: &str, err: &AnyError) {
        self.telemetry.record_store_error();
        tracing::warn!(operation, scan_key, error = %err, "scan store operation failed");
    }
}
