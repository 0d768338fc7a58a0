//! Bounded node cache with performance scoring.
//!
//! Entries are shared `Arc`s referenced by identity from tasks and
//! subtasks, never owned by them. The cache evicts the least-recently-seen
//! entry at capacity. Score components are monotonic atomic counters so
//! updates from concurrent subtasks need no global lock; the effective
//! score is reduced from the counters on read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use taskgrid_types::{NodeId, NodeInfo};
use tracing::debug;

/// Score bonus per completed subtask.
const COMPLETED_BONUS: u64 = 50;

/// Score penalty per failed or timed-out subtask.
const FAILED_PENALTY: u64 = 100;

/// A cached network participant with live score counters.
#[derive(Debug)]
pub struct NodeEntry {
    info: NodeInfo,
    completed: AtomicU64,
    failed: AtomicU64,
    last_seen_ms: AtomicU64,
}

impl NodeEntry {
    fn new(info: NodeInfo, now_ms: u64) -> Self {
        Self {
            info,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }

    /// The node's identity.
    pub fn id(&self) -> &NodeId {
        &self.info.id
    }

    /// Static node information as declared at first contact.
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Record a completed subtask.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed or timed-out subtask.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed-subtask counter.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Failed-subtask counter.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Reduce the counters into an effective selection score:
    /// declared performance plus a completion bonus, minus a failure
    /// penalty, saturating at zero.
    pub fn effective_score(&self) -> u64 {
        self.info
            .performance
            .saturating_add(self.completed() * COMPLETED_BONUS)
            .saturating_sub(self.failed() * FAILED_PENALTY)
    }

    /// Refresh the recency stamp.
    pub fn touch(&self, now_ms: u64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    /// When the node was last seen, unix ms.
    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }
}

/// Bounded cache of known nodes with least-recently-seen eviction.
#[derive(Debug)]
pub struct NodeCache {
    entries: HashMap<NodeId, Arc<NodeEntry>>,
    capacity: usize,
}

impl NodeCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a node by identity.
    pub fn get(&self, id: &NodeId) -> Option<Arc<NodeEntry>> {
        self.entries.get(id).cloned()
    }

    /// Insert a node on first contact or refresh its recency stamp.
    ///
    /// At capacity, the least-recently-seen entry is evicted to make room.
    pub fn upsert(&mut self, info: NodeInfo, now_ms: u64) -> Arc<NodeEntry> {
        if let Some(entry) = self.entries.get(&info.id) {
            entry.touch(now_ms);
            return entry.clone();
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|entry| entry.last_seen_ms())
                .map(|entry| entry.id().clone())
            {
                debug!(node_id = %oldest, "Evicting least-recently-seen node");
                self.entries.remove(&oldest);
            }
        }

        let entry = Arc::new(NodeEntry::new(info.clone(), now_ms));
        self.entries.insert(info.id, entry.clone());
        entry
    }

    /// Snapshot of all cached node ids.
    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.keys().cloned().collect()
    }

    /// Snapshot of all cached node infos, for peer exchange replies.
    pub fn infos(&self) -> Vec<NodeInfo> {
        self.entries.values().map(|e| e.info().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, performance: u64) -> NodeInfo {
        NodeInfo {
            id: NodeId::new(id),
            address: format!("10.0.0.1:4010{}", performance % 10),
            performance,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let mut cache = NodeCache::new(4);
        cache.upsert(info("aa", 100), 1);
        let entry = cache.get(&NodeId::new("aa")).unwrap();
        assert_eq!(entry.info().performance, 100);
        assert!(cache.get(&NodeId::new("bb")).is_none());
    }

    #[test]
    fn test_upsert_refreshes_recency() {
        let mut cache = NodeCache::new(4);
        cache.upsert(info("aa", 100), 1);
        cache.upsert(info("aa", 100), 99);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&NodeId::new("aa")).unwrap().last_seen_ms(), 99);
    }

    #[test]
    fn test_least_recently_seen_eviction() {
        let mut cache = NodeCache::new(2);
        cache.upsert(info("aa", 100), 1);
        cache.upsert(info("bb", 100), 2);
        // "aa" is oldest; inserting a third node evicts it.
        cache.upsert(info("cc", 100), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&NodeId::new("aa")).is_none());
        assert!(cache.get(&NodeId::new("bb")).is_some());
        assert!(cache.get(&NodeId::new("cc")).is_some());
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let mut cache = NodeCache::new(2);
        cache.upsert(info("aa", 100), 1);
        cache.upsert(info("bb", 100), 2);
        // Seeing "aa" again makes "bb" the eviction candidate.
        cache.upsert(info("aa", 100), 3);
        cache.upsert(info("cc", 100), 4);
        assert!(cache.get(&NodeId::new("aa")).is_some());
        assert!(cache.get(&NodeId::new("bb")).is_none());
    }

    #[test]
    fn test_effective_score_reduction() {
        let mut cache = NodeCache::new(4);
        let entry = cache.upsert(info("aa", 1000), 1);
        assert_eq!(entry.effective_score(), 1000);

        entry.record_completed();
        entry.record_completed();
        assert_eq!(entry.effective_score(), 1100);

        entry.record_failed();
        assert_eq!(entry.effective_score(), 1000);
    }

    #[test]
    fn test_score_saturates_at_zero() {
        let mut cache = NodeCache::new(4);
        let entry = cache.upsert(info("aa", 50), 1);
        entry.record_failed();
        entry.record_failed();
        assert_eq!(entry.effective_score(), 0);
    }

    #[test]
    fn test_shared_entries_update_concurrently() {
        let mut cache = NodeCache::new(4);
        let entry = cache.upsert(info("aa", 0), 1);
        let clone = cache.get(&NodeId::new("aa")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = clone.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        entry.record_completed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(entry.completed(), 800);
    }
}
