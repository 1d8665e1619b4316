//! Public create/claim/query/progress surface over the scan repository.

use crate::range::RangeNode;
use crate::store::{ScanError, ScanRepository};
use std::ops::Range;

pub struct BlockRangeScanner {
    repository: ScanRepository,
}

impl BlockRangeScanner {
    pub fn new(repository: ScanRepository) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &ScanRepository {
        &self.repository
    }

    /// Creates the scan tree for `scan_key` over `[start, end)`.
    ///
    /// Fails with [`ScanError::DuplicateScan`] when a tree already exists for
    /// the key, whatever interval it covers.
    pub async fn create_scan(&self, scan_key: &str, start: u64, end: u64) -> Result<(), ScanError> {
        self.repository.create_scan_nodes(scan_key, start, end).await
    }

    pub async fn has_scan_key(&self, scan_key: &str, span: Option<Range<u64>>) -> bool {
        self.repository.has_scan_key(scan_key, span).await
    }

    pub async fn get_next_scan_node(&self, scan_key: &str) -> Option<RangeNode> {
        self.repository.start_next_scan(scan_key).await
    }

    pub async fn has_unscanned_blocks(&self, scan_key: &str, span: Option<Range<u64>>) -> bool {
        self.repository.has_unscanned_nodes(scan_key, span).await
    }

    pub async fn update_scan_progress(&self, scan_key: &str, block_number: u64) {
        if !self
            .repository
            .update_scanned_block_number(scan_key, block_number)
            .await
        {
            tracing::trace!(scan_key, block_number, "scan progress unchanged");
        }
    }

    pub async fn complete_scan_node(&self, scan_key: &str, node: &RangeNode) -> bool {
        self.repository.complete_scan_node(scan_key, node).await
    }

    pub async fn count_scan_nodes(&self, scan_key: &str, start: u64, end: u64) -> i64 {
        self.repository.count_scan_nodes(scan_key, start, end).await
    }

    pub async fn remove_all(&self, scan_key: &str) -> Result<u64, ScanError> {
        self.repository.remove_all(scan_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangePartitioner;
    use crate::runtime::telemetry::Telemetry;
    use crate::store::MemoryScanStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn scanner(chunk: u64) -> BlockRangeScanner {
        BlockRangeScanner::new(ScanRepository::new(
            Arc::new(MemoryScanStore::new()),
            RangePartitioner::new(chunk).unwrap(),
            Duration::from_secs(60),
            Arc::new(Telemetry::default()),
        ))
    }

    #[tokio::test]
    async fn exhausting_claims_visits_every_leaf_once() {
        let scanner = scanner(4);
        scanner.create_scan("k", 0, 10).await.unwrap();

        let mut visited = Vec::new();
        while let Some(node) = scanner.get_next_scan_node("k").await {
            assert!(node.is_leaf_node());
            visited.push((node.start(), node.end()));
            scanner.complete_scan_node("k", &node).await;
        }
        visited.sort_unstable();
        assert_eq!(visited, vec![(0, 4), (4, 8), (8, 10)]);
        assert!(!scanner.has_unscanned_blocks("k", None).await);
    }

    #[tokio::test]
    async fn progress_to_leaf_end_completes_it() {
        let scanner = scanner(4);
        scanner.create_scan("k", 0, 4).await.unwrap();

        let node = scanner.get_next_scan_node("k").await.unwrap();
        scanner.update_scan_progress("k", 1).await;
        assert!(scanner.has_unscanned_blocks("k", None).await);
        scanner.update_scan_progress("k", 3).await;
        assert!(!scanner.has_unscanned_blocks("k", None).await);
        assert!(!scanner.complete_scan_node("k", &node).await);
        assert!(scanner.get_next_scan_node("k").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_scan_is_rejected_regardless_of_overlap() {
        let scanner = scanner(4);
        scanner.create_scan("k", 0, 10).await.unwrap();
        let err = scanner.create_scan("k", 50, 60).await.unwrap_err();
        assert!(matches!(err, ScanError::DuplicateScan { .. }));
        assert!(scanner.has_scan_key("k", Some(0..1)).await);
        assert!(!scanner.has_scan_key("k", Some(50..60)).await);
    }
}
