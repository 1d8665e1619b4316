use super::{ScanFilter, ScanStore};
use crate::range::{NodeHash, RangeNode};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Process-local scan store.
///
/// All nodes live in one mutex-guarded map keyed by hash, so each primitive
/// (including claim) is a single critical section. Suitable for tests and
/// single-process deployments; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryScanStore {
    nodes: Mutex<HashMap<NodeHash, RangeNode>>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every node stored for `scan_key`, ordered by `(start, depth)`.
    pub fn snapshot(&self, scan_key: &str) -> Vec<RangeNode> {
        let nodes = self.lock();
        let mut out: Vec<RangeNode> = nodes
            .values()
            .filter(|node| node.scan_key() == scan_key)
            .cloned()
            .collect();
        out.sort_by_key(|node| (node.start(), node.tree_depth()));
        out
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeHash, RangeNode>> {
        // A panic while holding the lock cannot leave a node half-written.
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert_sync(&self, nodes: &[RangeNode]) -> Result<()> {
        insert_locked(&mut self.lock(), nodes)
    }

    fn insert_tree_sync(&self, scan_key: &str, nodes: &[RangeNode]) -> Result<bool> {
        let mut stored = self.lock();
        if stored.values().any(|node| node.scan_key() == scan_key) {
            return Ok(false);
        }
        insert_locked(&mut stored, nodes)?;
        Ok(true)
    }

    fn claim_sync(
        &self,
        scan_key: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<RangeNode> {
        let mut stored = self.lock();
        let hash = stored
            .values()
            .filter(|node| node.scan_key() == scan_key && node.is_claimable(stale_before))
            .min_by_key(|node| (node.timestamp(), node.start()))
            .map(|node| node.hash().clone())?;
        let node = stored.get_mut(&hash)?;
        node.mark_claimed(now);
        Some(node.clone())
    }

    fn progress_sync(&self, scan_key: &str, block_number: u64, now: DateTime<Utc>) -> bool {
        let mut stored = self.lock();
        stored
            .values_mut()
            .find(|node| {
                node.scan_key() == scan_key
                    && node.is_leaf_node()
                    && node.is_claimed()
                    && node.contains(block_number)
            })
            .map(|node| node.record_progress(block_number, now))
            .unwrap_or(false)
    }
}

fn insert_locked(stored: &mut HashMap<NodeHash, RangeNode>, nodes: &[RangeNode]) -> Result<()> {
    for (idx, node) in nodes.iter().enumerate() {
        let repeated = nodes[..idx].iter().any(|other| other.hash() == node.hash());
        if repeated || stored.contains_key(node.hash()) {
            bail!(
                "scan node [{}, {}) for key {} already exists",
                node.start(),
                node.end(),
                node.scan_key()
            );
        }
    }
    for node in nodes {
        stored.insert(node.hash().clone(), node.clone());
    }
    Ok(())
}

impl ScanStore for MemoryScanStore {
    fn insert_nodes<'a>(&'a self, nodes: &'a [RangeNode]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.insert_sync(nodes) })
    }

    fn insert_tree<'a>(
        &'a self,
        scan_key: &'a str,
        nodes: &'a [RangeNode],
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.insert_tree_sync(scan_key, nodes) })
    }

    fn claim_next_leaf<'a>(
        &'a self,
        scan_key: &'a str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<RangeNode>>> {
        Box::pin(async move { Ok(self.claim_sync(scan_key, stale_before, now)) })
    }

    fn record_progress<'a>(
        &'a self,
        scan_key: &'a str,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.progress_sync(scan_key, block_number, now)) })
    }

    fn complete_node<'a>(
        &'a self,
        scan_key: &'a str,
        hash: &'a NodeHash,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut stored = self.lock();
            Ok(match stored.get_mut(hash) {
                Some(node) if node.scan_key() == scan_key => node.mark_complete(now),
                _ => false,
            })
        })
    }

    fn has_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.lock().values().any(|node| filter.matches(node))) })
    }

    fn has_incomplete_leaves<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .values()
                .any(|node| filter.matches(node) && node.is_leaf_node() && !node.is_complete()))
        })
    }

    fn count_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .values()
                .filter(|node| filter.matches(node))
                .count() as u64)
        })
    }

    fn remove_all<'a>(&'a self, scan_key: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut stored = self.lock();
            let before = stored.len();
            stored.retain(|_, node| node.scan_key() != scan_key);
            Ok((before - stored.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangePartitioner;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn seed(store: &MemoryScanStore, key: &str, start: u64, end: u64, chunk: u64) {
        let root = RangeNode::root(key, start, end);
        let mut nodes = vec![root.clone()];
        nodes.extend(RangePartitioner::new(chunk).unwrap().partition(&root).unwrap());
        store.insert_sync(&nodes).unwrap();
    }

    fn stale_before(now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::seconds(60)
    }

    #[tokio::test]
    async fn claims_each_leaf_once_then_none() {
        let store = MemoryScanStore::new();
        seed(&store, "k", 0, 10, 4);

        let mut claimed = Vec::new();
        loop {
            let now = Utc::now();
            match store.claim_next_leaf("k", stale_before(now), now).await.unwrap() {
                Some(node) => claimed.push((node.start(), node.end())),
                None => break,
            }
        }
        claimed.sort_unstable();
        assert_eq!(claimed, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_leaf() {
        let store = Arc::new(MemoryScanStore::new());
        seed(&store, "k", 0, 500, 5);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let now = Utc::now();
                    match store
                        .claim_next_leaf("k", stale_before(now), now)
                        .await
                        .unwrap()
                    {
                        Some(node) => mine.push(node.hash().clone()),
                        None => return mine,
                    }
                }
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for hash in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(hash), "leaf handed out twice");
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn stale_claims_become_claimable_again() {
        let store = MemoryScanStore::new();
        seed(&store, "k", 0, 4, 4);

        let first_claim = Utc::now() - ChronoDuration::seconds(120);
        let node = store
            .claim_next_leaf("k", stale_before(first_claim), first_claim)
            .await
            .unwrap()
            .expect("leaf claimable");
        assert!(node.is_claimed());

        let now = Utc::now();
        let fresh_window = first_claim - ChronoDuration::seconds(1);
        assert!(store
            .claim_next_leaf("k", fresh_window, now)
            .await
            .unwrap()
            .is_none());

        let reclaimed = store
            .claim_next_leaf("k", stale_before(now), now)
            .await
            .unwrap()
            .expect("abandoned claim should be recovered");
        assert_eq!(reclaimed.hash(), node.hash());
        assert_eq!(reclaimed.start_timestamp(), Some(now));
    }

    #[tokio::test]
    async fn progress_only_touches_claimed_leaf_and_is_idempotent() {
        let store = MemoryScanStore::new();
        seed(&store, "k", 0, 10, 4);
        let now = Utc::now();

        assert!(!store.record_progress("k", 5, now).await.unwrap());

        let leaf = store
            .claim_next_leaf("k", stale_before(now), now)
            .await
            .unwrap()
            .unwrap();
        let inside = leaf.start() + 1;
        assert!(store.record_progress("k", inside, now).await.unwrap());
        assert!(!store.record_progress("k", inside, now).await.unwrap());

        let filter = ScanFilter::key("k").within(Some(leaf.start()..leaf.end()));
        assert!(store.has_incomplete_leaves(&filter).await.unwrap());
        assert!(store
            .record_progress("k", leaf.end() - 1, now)
            .await
            .unwrap());
        assert!(!store.has_incomplete_leaves(&filter).await.unwrap());
        assert!(store
            .has_incomplete_leaves(&ScanFilter::key("k"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejects_duplicate_coordinates_atomically() {
        let store = MemoryScanStore::new();
        let root = RangeNode::root("k", 0, 10);
        store.insert_nodes(&[root.clone()]).await.unwrap();

        let other = RangeNode::root("k", 20, 30);
        let err = store
            .insert_nodes(&[other.clone(), root])
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("already exists"));
        assert!(!store
            .has_nodes(&ScanFilter::key("k").within(Some(20..30)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tree_insert_refuses_key_with_existing_nodes() {
        let store = MemoryScanStore::new();
        let first = RangeNode::root("k", 0, 10);
        assert!(store.insert_tree("k", &[first]).await.unwrap());

        let disjoint = RangeNode::root("k", 100, 200);
        assert!(!store.insert_tree("k", &[disjoint]).await.unwrap());
        assert_eq!(store.snapshot("k").len(), 1);

        let other_key = RangeNode::root("j", 100, 200);
        assert!(store.insert_tree("j", &[other_key]).await.unwrap());
    }

    #[tokio::test]
    async fn keys_are_isolated_and_removable() {
        let store = MemoryScanStore::new();
        seed(&store, "a", 0, 10, 4);
        seed(&store, "b", 0, 10, 4);

        assert_eq!(store.count_nodes(&ScanFilter::key("a")).await.unwrap(), 4);
        assert_eq!(store.remove_all("a").await.unwrap(), 4);
        assert!(!store.has_nodes(&ScanFilter::key("a")).await.unwrap());
        assert_eq!(store.snapshot("b").len(), 4);
    }
}
