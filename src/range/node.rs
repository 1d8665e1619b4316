use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived identity of a range node.
///
/// Computed from `(scan_key, start, end)` only, so two processes describing
/// the same sub-range of the same scan always agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeHash(String);

impl NodeHash {
    pub fn compute(scan_key: &str, start: u64, end: u64) -> Self {
        let mut hasher = Sha256::new();
        // Length prefix keeps `("ab", ..)` and `("a", ..)` from sharing a preimage prefix.
        hasher.update((scan_key.len() as u64).to_be_bytes());
        hasher.update(scan_key.as_bytes());
        hasher.update(start.to_be_bytes());
        hasher.update(end.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// By-value reference to a node's parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentRef {
    pub start: u64,
    pub end: u64,
    pub scan_key: String,
    pub tree_depth: u32,
}

/// One interval `[start, end)` of a scan tree.
///
/// Coordinates and hash are fixed at construction; only claim/progress
/// bookkeeping changes afterwards, and only through the scan store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeNode {
    hash: NodeHash,
    start: u64,
    end: u64,
    scan_key: String,
    tree_depth: u32,
    is_leaf_node: bool,
    processed_block: Option<u64>,
    parent: Option<ParentRef>,
    timestamp: DateTime<Utc>,
    start_timestamp: Option<DateTime<Utc>>,
    end_timestamp: Option<DateTime<Utc>>,
}

/// Raw column values used to rebuild a node loaded from a store.
#[derive(Debug, Clone)]
pub struct RangeNodeParts {
    pub start: u64,
    pub end: u64,
    pub scan_key: String,
    pub tree_depth: u32,
    pub is_leaf_node: bool,
    pub processed_block: Option<u64>,
    pub parent: Option<ParentRef>,
    pub timestamp: DateTime<Utc>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl RangeNode {
    /// Builds the depth-0 node of a scan tree. Roots are never claimed.
    pub fn root(scan_key: impl Into<String>, start: u64, end: u64) -> Self {
        Self::from_parts(RangeNodeParts {
            start,
            end,
            scan_key: scan_key.into(),
            tree_depth: 0,
            is_leaf_node: false,
            processed_block: None,
            parent: None,
            timestamp: Utc::now(),
            start_timestamp: None,
            end_timestamp: None,
        })
    }

    /// Builds a direct child of `parent` covering `[start, end)`.
    pub fn child(parent: &RangeNode, start: u64, end: u64, is_leaf_node: bool) -> Self {
        Self::from_parts(RangeNodeParts {
            start,
            end,
            scan_key: parent.scan_key.clone(),
            tree_depth: parent.tree_depth + 1,
            is_leaf_node,
            processed_block: None,
            parent: Some(parent.as_parent_ref()),
            timestamp: parent.timestamp,
            start_timestamp: None,
            end_timestamp: None,
        })
    }

    /// Rebuilds a node from stored columns. The hash is always recomputed.
    pub fn from_parts(parts: RangeNodeParts) -> Self {
        let RangeNodeParts {
            start,
            end,
            scan_key,
            tree_depth,
            is_leaf_node,
            processed_block,
            parent,
            timestamp,
            start_timestamp,
            end_timestamp,
        } = parts;

        Self {
            hash: NodeHash::compute(&scan_key, start, end),
            start,
            end,
            scan_key,
            tree_depth,
            is_leaf_node,
            processed_block,
            parent,
            timestamp,
            start_timestamp,
            end_timestamp,
        }
    }

    pub fn hash(&self) -> &NodeHash {
        &self.hash
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn scan_key(&self) -> &str {
        &self.scan_key
    }

    pub fn tree_depth(&self) -> u32 {
        self.tree_depth
    }

    pub fn is_leaf_node(&self) -> bool {
        self.is_leaf_node
    }

    pub fn processed_block(&self) -> Option<u64> {
        self.processed_block
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.start_timestamp
    }

    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.end_timestamp
    }

    /// Number of blocks covered by the node.
    pub fn width(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.start <= block_number && block_number < self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// True once the whole interval is confirmed or the node was marked complete.
    pub fn is_complete(&self) -> bool {
        if self.end_timestamp.is_some() {
            return true;
        }
        match self.processed_block {
            Some(processed) => processed.saturating_add(1) >= self.end,
            None => false,
        }
    }

    /// First block that still needs scanning.
    pub fn resume_from(&self) -> u64 {
        match self.processed_block {
            Some(processed) => processed.saturating_add(1).max(self.start).min(self.end),
            None => self.start,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.start_timestamp.is_some()
    }

    /// Claim bookkeeping is free when never claimed or last touched before `stale_before`.
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        if !self.is_leaf_node || self.is_complete() {
            return false;
        }
        match self.start_timestamp {
            None => true,
            Some(_) => self.timestamp < stale_before,
        }
    }

    pub fn as_parent_ref(&self) -> ParentRef {
        ParentRef {
            start: self.start,
            end: self.end,
            scan_key: self.scan_key.clone(),
            tree_depth: self.tree_depth,
        }
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.start_timestamp = Some(now);
        self.timestamp = now;
    }

    /// Moves `processed_block` forward; lower or repeated values are no-ops.
    pub(crate) fn record_progress(&mut self, block_number: u64, now: DateTime<Utc>) -> bool {
        let clamped = block_number.min(self.end.saturating_sub(1));
        if self.processed_block.is_some_and(|current| current >= clamped) {
            return false;
        }
        self.processed_block = Some(clamped);
        self.timestamp = now;
        if self.is_complete() && self.end_timestamp.is_none() {
            self.end_timestamp = Some(now);
        }
        true
    }

    pub(crate) fn mark_complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.end_timestamp.is_some() {
            return false;
        }
        self.processed_block = Some(self.end.saturating_sub(1));
        self.timestamp = now;
        self.end_timestamp = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;

    #[test]
    fn hash_is_deterministic_for_equal_coordinates() {
        let a = RangeNode::root("erc20", 100, 200);
        let b = RangeNode::root("erc20", 100, 200);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), &NodeHash::compute("erc20", 100, 200));
    }

    #[test]
    fn hash_is_lowercase_hex_of_a_sha256_digest() {
        let hash = NodeHash::compute("erc20", 100, 200);
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        assert_eq!(hex::decode(hash.as_str()).unwrap().len(), 32);
    }

    #[test]
    fn changing_any_coordinate_changes_the_hash() {
        let mut seen = HashSet::new();
        for key in ["a", "b", "ab"] {
            for start in 0..6u64 {
                for end in (start + 1)..8u64 {
                    assert!(
                        seen.insert(NodeHash::compute(key, start, end)),
                        "collision for ({key}, {start}, {end})"
                    );
                }
            }
        }
    }

    #[test]
    fn hash_does_not_depend_on_depth_or_parent() {
        let root = RangeNode::root("k", 0, 10);
        let child = RangeNode::child(&root, 0, 10, true);
        assert_eq!(root.hash(), child.hash());
        assert_eq!(child.tree_depth(), 1);
        assert_eq!(child.parent().map(|p| p.tree_depth), Some(0));
    }

    #[test]
    fn progress_is_monotonic_and_completes_leaf() {
        let root = RangeNode::root("k", 0, 10);
        let mut leaf = RangeNode::child(&root, 0, 4, true);
        let now = Utc::now();

        assert_eq!(leaf.resume_from(), 0);
        assert!(leaf.record_progress(1, now));
        assert!(!leaf.record_progress(1, now));
        assert!(!leaf.record_progress(0, now));
        assert_eq!(leaf.resume_from(), 2);
        assert!(!leaf.is_complete());

        assert!(leaf.record_progress(3, now));
        assert!(leaf.is_complete());
        assert_eq!(leaf.end_timestamp(), Some(now));
        assert_eq!(leaf.resume_from(), 4);
    }

    #[test]
    fn claimable_respects_staleness_window() {
        let root = RangeNode::root("k", 0, 10);
        let mut leaf = RangeNode::child(&root, 0, 4, true);
        let now = Utc::now();
        assert!(leaf.is_claimable(now));
        assert!(!root.is_claimable(now));

        leaf.mark_claimed(now);
        assert!(!leaf.is_claimable(now - ChronoDuration::seconds(30)));
        assert!(leaf.is_claimable(now + ChronoDuration::seconds(1)));

        leaf.mark_complete(now);
        assert!(!leaf.is_claimable(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn serializes_to_persisted_shape() {
        let root = RangeNode::root("k", 0, 10);
        let leaf = RangeNode::child(&root, 4, 8, true);
        let value = serde_json::to_value(&leaf).unwrap();
        assert_eq!(value["start"], 4);
        assert_eq!(value["end"], 8);
        assert_eq!(value["scan_key"], "k");
        assert_eq!(value["tree_depth"], 1);
        assert_eq!(value["is_leaf_node"], true);
        assert!(value["processed_block"].is_null());
        assert_eq!(value["parent"]["end"], 10);
        assert_eq!(value["hash"], leaf.hash().as_str());
    }
}
