//! Thread-safe bounded LRU cache over time series.
//!
//! One instance backs each in-memory tier (L1 and L2 share this shape).
//! Internally an intrusive doubly-linked list over a slab, with an
//! id→slot map for O(1) lookups; the map and the list are always in
//! lock-step: every id in the map points at a live slot, every live slot
//! is referenced by exactly one map entry.
//!
//! `put` on an existing id **merges** rather than overwrites: only samples
//! strictly newer than the cached series' last timestamp are appended, so
//! re-applying the same write (WAL replay, repeated puts) never duplicates
//! samples.

use crate::config::CacheLevelConfig;
use crate::entry::{CacheEntryMetadata, CacheLevel};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tephra_core::{Error, Result, Sample, SeriesId, TimeSeries};

const NIL: usize = usize::MAX;

struct Node {
    id: SeriesId,
    series: Arc<TimeSeries>,
    meta: CacheEntryMetadata,
    prev: usize,
    next: usize,
}

struct LruInner {
    /// Slab of nodes; `None` marks a free slot.
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    map: FxHashMap<SeriesId, usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    current_bytes: usize,
}

impl LruInner {
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live slot")
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Remove the tail node, returning its id and series.
    fn pop_lru(&mut self) -> Option<(SeriesId, Arc<TimeSeries>)> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.detach(idx);
        let node = self.nodes[idx].take().expect("live tail");
        self.free.push(idx);
        self.map.remove(&node.id);
        self.current_bytes = self.current_bytes.saturating_sub(node.meta.size_bytes);
        Some((node.id, node.series))
    }
}

/// A bounded, thread-safe LRU cache keyed by series id.
pub struct LruCache {
    inner: Mutex<LruInner>,
    max_entries: usize,
    max_bytes: Option<usize>,
    level: CacheLevel,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruCache {
    /// Create a cache with the given limits.
    ///
    /// Returns `InvalidArgument` if `max_entries` is zero.
    pub fn new(config: &CacheLevelConfig, level: CacheLevel) -> Result<Self> {
        if config.max_entries == 0 {
            return Err(Error::InvalidArgument(
                "cache max_entries must be greater than 0".to_string(),
            ));
        }
        Ok(LruCache {
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free: Vec::new(),
                map: FxHashMap::default(),
                head: NIL,
                tail: NIL,
                current_bytes: 0,
            }),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            level,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Look up a series, marking it most recently used on a hit.
    pub fn get(&self, id: SeriesId) -> Option<Arc<TimeSeries>> {
        let mut inner = self.inner.lock();
        let idx = match inner.map.get(&id) {
            Some(&idx) => idx,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        inner.detach(idx);
        inner.push_front(idx);
        let node = inner.node_mut(idx);
        node.meta.record_access();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&node.series))
    }

    /// Insert or merge a series at the MRU position.
    ///
    /// An existing entry absorbs only the strictly-newer samples of
    /// `series` (the pointer is replaced wholesale, not mutated). A new
    /// entry evicts from the LRU end until both the entry and byte limits
    /// hold. Entries evicted here are dropped; the hierarchy uses
    /// [`LruCache::evict_lru`] when it needs to cascade them downward.
    pub fn put(&self, id: SeriesId, series: Arc<TimeSeries>) {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(&id) {
            let (old_size, merged) = {
                let node = inner.node(idx);
                (node.meta.size_bytes, merge_series(&node.series, &series))
            };
            if let Some(merged) = merged {
                let new_size = merged.approx_size_bytes();
                let node = inner.node_mut(idx);
                node.series = Arc::new(merged);
                node.meta.size_bytes = new_size;
                inner.current_bytes = inner.current_bytes - old_size + new_size;
            }
            inner.detach(idx);
            inner.push_front(idx);

            // A merge can outgrow the byte budget; shed cold entries, but
            // never the one just touched.
            if let Some(max_bytes) = self.max_bytes {
                while inner.current_bytes > max_bytes && inner.map.len() > 1 {
                    inner.pop_lru();
                }
            }
            return;
        }

        let size_bytes = series.approx_size_bytes();
        while inner.map.len() >= self.max_entries {
            inner.pop_lru();
        }
        if let Some(max_bytes) = self.max_bytes {
            while !inner.map.is_empty() && inner.current_bytes + size_bytes > max_bytes {
                inner.pop_lru();
            }
        }

        let node = Node {
            id,
            series,
            meta: CacheEntryMetadata::new(size_bytes, self.level),
            prev: NIL,
            next: NIL,
        };
        let idx = inner.alloc(node);
        inner.map.insert(id, idx);
        inner.push_front(idx);
        inner.current_bytes += size_bytes;
    }

    /// Drop an entry if present. Returns whether it was present.
    pub fn remove(&self, id: SeriesId) -> bool {
        self.take(id).is_some()
    }

    /// Remove and return an entry without touching hit/miss statistics.
    ///
    /// Used for cross-level moves, which should not look like workload.
    pub fn take(&self, id: SeriesId) -> Option<Arc<TimeSeries>> {
        let mut inner = self.inner.lock();
        let idx = inner.map.remove(&id)?;
        inner.detach(idx);
        let node = inner.nodes[idx].take().expect("live slot");
        inner.free.push(idx);
        inner.current_bytes = inner.current_bytes.saturating_sub(node.meta.size_bytes);
        Some(node.series)
    }

    /// Remove and return the least recently used entry.
    pub fn evict_lru(&self) -> Option<(SeriesId, Arc<TimeSeries>)> {
        self.inner.lock().pop_lru()
    }

    /// Id of the least recently used entry.
    pub fn lru_id(&self) -> Option<SeriesId> {
        let inner = self.inner.lock();
        if inner.tail == NIL {
            None
        } else {
            Some(inner.node(inner.tail).id)
        }
    }

    /// All cached ids, most recently used first.
    pub fn series_ids(&self) -> Vec<SeriesId> {
        let inner = self.inner.lock();
        let mut ids = Vec::with_capacity(inner.map.len());
        let mut idx = inner.head;
        while idx != NIL {
            let node = inner.node(idx);
            ids.push(node.id);
            idx = node.next;
        }
        ids
    }

    /// Copy of an entry's metadata, without counting as an access.
    pub fn metadata(&self, id: SeriesId) -> Option<CacheEntryMetadata> {
        let inner = self.inner.lock();
        inner.map.get(&id).map(|&idx| inner.node(idx).meta)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum entry count.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Whether either capacity limit is currently reached.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        if inner.map.len() >= self.max_entries {
            return true;
        }
        match self.max_bytes {
            Some(max) => inner.current_bytes >= max,
            None => false,
        }
    }

    /// Approximate bytes currently cached.
    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }

    /// Drop every entry, keeping configuration and statistics.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.free.clear();
        inner.map.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.current_bytes = 0;
    }

    /// Cumulative hits.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cumulative misses.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit ratio as a percentage; 0 when no lookups have happened.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hit_count() as f64;
        let misses = self.miss_count() as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses) * 100.0
        }
    }

    /// Zero the hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Merge samples of `incoming` that are strictly newer than the last
/// cached timestamp. Returns `None` when nothing new was contributed.
fn merge_series(existing: &TimeSeries, incoming: &TimeSeries) -> Option<TimeSeries> {
    let mut last = existing.last_timestamp();
    let mut fresh: Vec<Sample> = Vec::new();
    for sample in incoming.samples() {
        let newer = match last {
            Some(l) => sample.timestamp > l,
            None => true,
        };
        if newer {
            fresh.push(*sample);
            last = Some(sample.timestamp);
        }
    }
    if fresh.is_empty() {
        return None;
    }

    let mut samples = existing.samples().to_vec();
    samples.extend(fresh);
    Some(TimeSeries::from_parts(existing.labels().clone(), samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::Labels;

    fn cache(max_entries: usize) -> LruCache {
        LruCache::new(
            &CacheLevelConfig::with_max_entries(max_entries),
            CacheLevel::L1,
        )
        .unwrap()
    }

    fn series(name: &str, samples: &[(i64, f64)]) -> Arc<TimeSeries> {
        let labels = Labels::from_pairs([("metric", name)].iter().copied()).unwrap();
        let mut ts = TimeSeries::new(labels);
        for &(t, v) in samples {
            ts.push(t, v).unwrap();
        }
        Arc::new(ts)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = LruCache::new(&CacheLevelConfig::with_max_entries(0), CacheLevel::L1);
        assert!(result.is_err());
    }

    #[test]
    fn test_get_miss_returns_none() {
        let c = cache(4);
        assert!(c.get(1).is_none());
        assert_eq!(c.miss_count(), 1);
        assert_eq!(c.hit_count(), 0);
    }

    #[test]
    fn test_put_get_hit() {
        let c = cache(4);
        c.put(1, series("a", &[(1000, 1.0)]));
        let got = c.get(1).unwrap();
        assert_eq!(got.samples()[0].value, 1.0);
        assert_eq!(c.hit_count(), 1);
        assert_eq!(c.metadata(1).unwrap().access_count, 1);
    }

    #[test]
    fn test_lru_eviction_under_pressure() {
        // With capacity 2: put(1); put(2); get(1); put(3)
        // → 2 was least recently used and must be gone; 1 and 3 remain.
        let c = cache(2);
        c.put(1, series("a", &[(1, 1.0)]));
        c.put(2, series("b", &[(1, 2.0)]));
        assert!(c.get(1).is_some());
        c.put(3, series("c", &[(1, 3.0)]));

        assert!(c.get(2).is_none());
        assert!(c.get(1).is_some());
        assert!(c.get(3).is_some());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_lru_order_tracks_access() {
        let c = cache(3);
        c.put(1, series("a", &[(1, 1.0)]));
        c.put(2, series("b", &[(1, 2.0)]));
        c.put(3, series("c", &[(1, 3.0)]));
        assert_eq!(c.series_ids(), vec![3, 2, 1]);
        assert_eq!(c.lru_id(), Some(1));

        c.get(1).unwrap();
        assert_eq!(c.series_ids(), vec![1, 3, 2]);
        assert_eq!(c.lru_id(), Some(2));

        assert_eq!(c.evict_lru().unwrap().0, 2);
        assert_eq!(c.series_ids(), vec![1, 3]);
    }

    #[test]
    fn test_put_merges_only_strictly_newer() {
        let c = cache(4);
        c.put(1, series("a", &[(1000, 1.0), (2000, 2.0)]));
        // Overlapping update: 1500 and 2000 are not newer than 2000.
        c.put(1, series("a", &[(1500, 9.0), (2000, 9.0), (3000, 3.0)]));

        let got = c.get(1).unwrap();
        let timestamps: Vec<i64> = got.samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000]);
        assert_eq!(got.samples()[2].value, 3.0);
    }

    #[test]
    fn test_put_merge_is_idempotent() {
        let c = cache(4);
        let s = series("a", &[(1000, 1.0), (2000, 2.0)]);
        c.put(1, Arc::clone(&s));
        c.put(1, Arc::clone(&s));
        c.put(1, s);

        assert_eq!(c.get(1).unwrap().samples().len(), 2);
    }

    #[test]
    fn test_merge_into_empty_entry() {
        let c = cache(4);
        c.put(1, series("a", &[]));
        c.put(1, series("a", &[(1000, 1.0)]));
        assert_eq!(c.get(1).unwrap().samples().len(), 1);
    }

    #[test]
    fn test_remove() {
        let c = cache(4);
        c.put(1, series("a", &[(1, 1.0)]));
        assert!(c.remove(1));
        assert!(!c.remove(1));
        assert!(c.get(1).is_none());
    }

    #[test]
    fn test_take_does_not_count_stats() {
        let c = cache(4);
        c.put(1, series("a", &[(1, 1.0)]));
        assert!(c.take(1).is_some());
        assert!(c.take(1).is_none());
        assert_eq!(c.hit_count(), 0);
        assert_eq!(c.miss_count(), 0);
    }

    #[test]
    fn test_byte_budget_triggers_eviction() {
        let small = series("a", &[(1, 1.0)]);
        let budget = small.approx_size_bytes() * 2 + 1;
        let c = LruCache::new(
            &CacheLevelConfig::with_max_entries(100).with_max_bytes(budget),
            CacheLevel::L1,
        )
        .unwrap();

        c.put(1, series("a", &[(1, 1.0)]));
        c.put(2, series("b", &[(1, 1.0)]));
        assert_eq!(c.len(), 2);

        // The third entry exceeds the byte budget: the LRU entry goes.
        c.put(3, series("c", &[(1, 1.0)]));
        assert!(c.get(1).is_none());
        assert_eq!(c.len(), 2);
        assert!(c.current_bytes() <= budget);
    }

    #[test]
    fn test_slab_reuse_keeps_map_consistent() {
        let c = cache(2);
        for round in 0..10u64 {
            c.put(round, series(&format!("m{}", round), &[(1, 1.0)]));
        }
        assert_eq!(c.len(), 2);
        assert_eq!(c.series_ids(), vec![9, 8]);
        assert!(c.get(9).is_some());
        assert!(c.get(8).is_some());
        for old in 0..8u64 {
            assert!(c.get(old).is_none());
        }
    }

    #[test]
    fn test_clear() {
        let c = cache(4);
        c.put(1, series("a", &[(1, 1.0)]));
        c.put(2, series("b", &[(1, 1.0)]));
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.current_bytes(), 0);
        assert!(c.get(1).is_none());
    }

    #[test]
    fn test_hit_ratio() {
        let c = cache(4);
        assert_eq!(c.hit_ratio(), 0.0);
        c.put(1, series("a", &[(1, 1.0)]));
        c.get(1).unwrap();
        assert!(c.get(2).is_none());
        assert!((c.hit_ratio() - 50.0).abs() < f64::EPSILON);

        c.reset_stats();
        assert_eq!(c.hit_ratio(), 0.0);
    }
}
