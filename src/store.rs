//! Durable scan-tree persistence: the `ScanStore` primitives every backend
//! must provide, the in-memory and Postgres backends, and the repository that
//! layers duplicate detection and failure downgrading on top.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod repository;

use crate::range::{NodeHash, RangeNode};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::ops::Range;

pub use memory::MemoryScanStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresScanStore;
pub use repository::{ScanError, ScanRepository};

/// Selects the nodes of one scan key, optionally only those overlapping `span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub scan_key: String,
    pub span: Option<Range<u64>>,
}

impl ScanFilter {
    pub fn key(scan_key: impl Into<String>) -> Self {
        Self {
            scan_key: scan_key.into(),
            span: None,
        }
    }

    pub fn within(mut self, span: Option<Range<u64>>) -> Self {
        self.span = span;
        self
    }

    pub fn matches(&self, node: &RangeNode) -> bool {
        if node.scan_key() != self.scan_key {
            return false;
        }
        match &self.span {
            Some(span) => node.overlaps(span.start, span.end),
            None => true,
        }
    }
}

/// Storage primitives backing the scan repository.
///
/// Every mutation must be a single atomic operation against the backend:
/// in particular `claim_next_leaf` selects and marks in one step so that two
/// callers sharing the backend can never receive the same leaf.
pub trait ScanStore: Send + Sync {
    /// Inserts all nodes or none. Fails if any `(start, end, scan_key)` already exists.
    fn insert_nodes<'a>(&'a self, nodes: &'a [RangeNode]) -> BoxFuture<'a, Result<()>>;

    /// Inserts a whole tree for `scan_key` only if the key has no nodes yet.
    /// The existence check and the insert are one atomic step; returns `false`
    /// without writing anything when the key is already taken.
    fn insert_tree<'a>(
        &'a self,
        scan_key: &'a str,
        nodes: &'a [RangeNode],
    ) -> BoxFuture<'a, Result<bool>>;

    /// Claims the oldest claimable leaf for `scan_key`: incomplete and either
    /// never claimed or last touched before `stale_before`.
    fn claim_next_leaf<'a>(
        &'a self,
        scan_key: &'a str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<RangeNode>>>;

    /// Advances `processed_block` on the claimed leaf containing `block_number`.
    /// Returns `false` when no leaf matched or the value did not move forward.
    fn record_progress<'a>(
        &'a self,
        scan_key: &'a str,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Marks a node fully processed.
    fn complete_node<'a>(
        &'a self,
        scan_key: &'a str,
        hash: &'a NodeHash,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>>;

    fn has_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>>;

    fn has_incomplete_leaves<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>>;

    fn count_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<u64>>;

    /// Deletes every node of `scan_key`, returning how many were removed.
    fn remove_all<'a>(&'a self, scan_key: &'a str) -> BoxFuture<'a, Result<u64>>;
}
