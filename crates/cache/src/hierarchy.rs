//! The L1/L2/L3 cache hierarchy.
//!
//! Composes two in-memory LRU levels and a cold-store callback into one
//! get/put surface. Entries move between levels on access patterns:
//! promotion on the read path (and in maintenance), demotion only in the
//! background maintenance pass, never on the put hot path.
//!
//! Cross-level operations and maintenance serialize on a reentrant mutex.
//! A `get` satisfied by L1 alone deliberately skips that lock.

use crate::config::CacheHierarchyConfig;
use crate::entry::CacheLevel;
use crate::lru::LruCache;
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tephra_core::{Result, SeriesId, TimeSeries};
use tracing::{debug, warn};

/// Persistence seam for the coldest tier.
///
/// The hierarchy calls this when an entry is demoted out of memory
/// entirely. Reads from cold storage happen outside the cache (the engine
/// consults external storage on a full miss), so the seam stays a single
/// method.
pub trait ColdStore: Send + Sync {
    /// Persist a series being surrendered by the cache. Returns whether
    /// the data was accepted.
    fn persist(&self, id: SeriesId, series: &TimeSeries) -> bool;
}

#[derive(Default)]
struct HierarchyCounters {
    total_hits: AtomicU64,
    total_misses: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

/// Point-in-time snapshot of hierarchy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HierarchyStats {
    /// Hits across all levels.
    pub total_hits: u64,
    /// Lookups that missed every level.
    pub total_misses: u64,
    /// Hits served by L1.
    pub l1_hits: u64,
    /// Hits served by L2.
    pub l2_hits: u64,
    /// L2→L1 moves.
    pub promotions: u64,
    /// Downward moves (L1→L2, and out of memory to the cold store).
    pub demotions: u64,
}

struct HierarchyShared {
    config: CacheHierarchyConfig,
    l1: LruCache,
    l2: Option<LruCache>,
    cold: RwLock<Option<Arc<dyn ColdStore>>>,
    /// Serializes maintenance and any get/put that crosses levels.
    cross_level: ReentrantMutex<()>,
    counters: HierarchyCounters,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    background_running: AtomicBool,
}

/// Multi-level cache over time series.
pub struct CacheHierarchy {
    shared: Arc<HierarchyShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheHierarchy {
    /// Build a hierarchy from configuration.
    ///
    /// The background maintenance thread starts immediately when
    /// `enable_background_processing` is set.
    pub fn new(config: CacheHierarchyConfig) -> Result<Self> {
        let l1 = LruCache::new(&config.l1, CacheLevel::L1)?;
        let l2 = match &config.l2 {
            Some(level) => Some(LruCache::new(level, CacheLevel::L2)?),
            None => None,
        };

        let start_background = config.enable_background_processing;
        let hierarchy = CacheHierarchy {
            shared: Arc::new(HierarchyShared {
                config,
                l1,
                l2,
                cold: RwLock::new(None),
                cross_level: ReentrantMutex::new(()),
                counters: HierarchyCounters::default(),
                shutdown: Mutex::new(false),
                shutdown_cv: Condvar::new(),
                background_running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        };

        if start_background {
            hierarchy.start_background_processing();
        }
        Ok(hierarchy)
    }

    /// Install the cold-store callback for L3 demotions.
    pub fn set_cold_store(&self, store: Arc<dyn ColdStore>) {
        *self.shared.cold.write() = Some(store);
    }

    /// Look a series up across levels.
    ///
    /// L1 hits return without touching the cross-level lock. An L2 hit may
    /// promote the entry to L1 when its access count has crossed the
    /// promotion threshold and L1 has room — promotion never forces an
    /// eviction. A full miss returns `None`; the caller is expected to
    /// read through to external storage.
    pub fn get(&self, id: SeriesId) -> Option<Arc<TimeSeries>> {
        let shared = &self.shared;

        if let Some(series) = shared.l1.get(id) {
            shared.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            shared.counters.total_hits.fetch_add(1, Ordering::Relaxed);
            return Some(series);
        }

        let _guard = shared.cross_level.lock();
        if let Some(l2) = &shared.l2 {
            if let Some(series) = l2.get(id) {
                shared.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                shared.counters.total_hits.fetch_add(1, Ordering::Relaxed);

                if let Some(meta) = l2.metadata(id) {
                    if meta.access_count > shared.config.l1_promotion_threshold
                        && !shared.l1.is_full()
                    {
                        promote_to_l1(shared, id);
                    }
                }
                return Some(series);
            }
        }

        shared.counters.total_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Admit a series.
    ///
    /// Insertion prefers L1, spills to L2, and when both are full evicts
    /// the L1 LRU entry downward (cascading to the cold store if L2 must
    /// also shed) before placing the new series in L1. No displaced entry
    /// is dropped silently: everything either moves a level down or is
    /// handed to the cold-store callback.
    pub fn put(&self, id: SeriesId, series: Arc<TimeSeries>) {
        let shared = &self.shared;
        let _guard = shared.cross_level.lock();

        // Merge-updates of an already-cached series stay in place.
        if shared.l1.metadata(id).is_some() {
            shared.l1.put(id, series);
            return;
        }
        if let Some(l2) = &shared.l2 {
            if l2.metadata(id).is_some() {
                l2.put(id, series);
                return;
            }
        }

        if !shared.l1.is_full() {
            shared.l1.put(id, series);
            return;
        }
        if let Some(l2) = &shared.l2 {
            if !l2.is_full() {
                l2.put(id, series);
                return;
            }
        }

        // Both levels full: cascade the L1 LRU entry downward, then take
        // its place.
        if let Some((evicted_id, evicted_series)) = shared.l1.evict_lru() {
            match &shared.l2 {
                Some(l2) => {
                    if l2.is_full() {
                        if let Some((cold_id, cold_series)) = l2.evict_lru() {
                            persist_to_cold(shared, cold_id, &cold_series);
                        }
                    }
                    l2.put(evicted_id, evicted_series);
                }
                None => persist_to_cold(shared, evicted_id, &evicted_series),
            }
        }
        shared.l1.put(id, series);
    }

    /// Whether a series is present in L1 or L2, without counting as an
    /// access or disturbing LRU order.
    pub fn contains(&self, id: SeriesId) -> bool {
        if self.shared.l1.metadata(id).is_some() {
            return true;
        }
        match &self.shared.l2 {
            Some(l2) => l2.metadata(id).is_some(),
            None => false,
        }
    }

    /// Drop a series from every level. Returns whether it was present.
    pub fn remove(&self, id: SeriesId) -> bool {
        let _guard = self.shared.cross_level.lock();
        let from_l1 = self.shared.l1.remove(id);
        let from_l2 = self
            .shared
            .l2
            .as_ref()
            .map(|l2| l2.remove(id))
            .unwrap_or(false);
        from_l1 || from_l2
    }

    /// Drop everything and zero the statistics.
    pub fn clear(&self) {
        let _guard = self.shared.cross_level.lock();
        self.shared.l1.clear();
        if let Some(l2) = &self.shared.l2 {
            l2.clear();
        }
        self.reset_stats();
    }

    /// Run one maintenance pass inline.
    ///
    /// The background thread calls this on its interval; tests call it
    /// directly for determinism.
    pub fn maintain(&self) {
        maintenance_pass(&self.shared);
    }

    /// Start the background maintenance thread (idempotent).
    pub fn start_background_processing(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        *self.shared.shutdown.lock() = false;
        self.shared.background_running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tephra-cache-maintenance".to_string())
            .spawn(move || background_loop(shared));
        match handle {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                self.shared.background_running.store(false, Ordering::Release);
                warn!(target: "tephra::cache", error = %e, "Failed to spawn cache maintenance thread");
            }
        }
    }

    /// Stop the background maintenance thread and join it (idempotent).
    pub fn stop_background_processing(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            *self.shared.shutdown.lock() = true;
            self.shared.shutdown_cv.notify_all();
            worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.shared.background_running.store(false, Ordering::Release);
    }

    /// Whether the maintenance thread is running.
    pub fn is_background_processing_running(&self) -> bool {
        self.shared.background_running.load(Ordering::Acquire)
    }

    /// Snapshot the hierarchy counters.
    pub fn stats_snapshot(&self) -> HierarchyStats {
        let c = &self.shared.counters;
        HierarchyStats {
            total_hits: c.total_hits.load(Ordering::Relaxed),
            total_misses: c.total_misses.load(Ordering::Relaxed),
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
        }
    }

    /// Overall hit ratio as a percentage; 0 when no lookups have happened.
    pub fn hit_ratio(&self) -> f64 {
        let stats = self.stats_snapshot();
        let total = stats.total_hits + stats.total_misses;
        if total == 0 {
            0.0
        } else {
            stats.total_hits as f64 / total as f64 * 100.0
        }
    }

    /// Human-readable statistics block.
    pub fn stats(&self) -> String {
        let stats = self.stats_snapshot();
        let mut out = String::new();
        out.push_str("Cache Hierarchy Statistics:\n");
        out.push_str(&format!(
            "  Total: hits={} misses={} hit_ratio={:.2}%\n",
            stats.total_hits,
            stats.total_misses,
            self.hit_ratio()
        ));
        out.push_str(&format!(
            "  L1: entries={}/{} hits={}\n",
            self.shared.l1.len(),
            self.shared.l1.max_entries(),
            stats.l1_hits
        ));
        match &self.shared.l2 {
            Some(l2) => out.push_str(&format!(
                "  L2: entries={}/{} hits={}\n",
                l2.len(),
                l2.max_entries(),
                stats.l2_hits
            )),
            None => out.push_str("  L2: disabled\n"),
        }
        out.push_str(&format!(
            "  Movement: promotions={} demotions={}\n",
            stats.promotions, stats.demotions
        ));
        out
    }

    /// Zero all counters (level hit/miss counters included).
    pub fn reset_stats(&self) {
        let c = &self.shared.counters;
        c.total_hits.store(0, Ordering::Relaxed);
        c.total_misses.store(0, Ordering::Relaxed);
        c.l1_hits.store(0, Ordering::Relaxed);
        c.l2_hits.store(0, Ordering::Relaxed);
        c.promotions.store(0, Ordering::Relaxed);
        c.demotions.store(0, Ordering::Relaxed);
        self.shared.l1.reset_stats();
        if let Some(l2) = &self.shared.l2 {
            l2.reset_stats();
        }
    }

    /// The L1 level (read-only access for integration points and tests).
    pub fn l1(&self) -> &LruCache {
        &self.shared.l1
    }

    /// The L2 level, if configured.
    pub fn l2(&self) -> Option<&LruCache> {
        self.shared.l2.as_ref()
    }
}

impl Drop for CacheHierarchy {
    fn drop(&mut self) {
        self.stop_background_processing();
    }
}

fn promote_to_l1(shared: &HierarchyShared, id: SeriesId) {
    let l2 = match &shared.l2 {
        Some(l2) => l2,
        None => return,
    };
    if let Some(series) = l2.take(id) {
        shared.l1.put(id, series);
        shared.counters.promotions.fetch_add(1, Ordering::Relaxed);
        debug!(target: "tephra::cache", series = id, "Promoted series to L1");
    }
}

fn persist_to_cold(shared: &HierarchyShared, id: SeriesId, series: &Arc<TimeSeries>) {
    match shared.cold.read().as_ref() {
        Some(store) => {
            if !store.persist(id, series) {
                warn!(
                    target: "tephra::cache",
                    series = id,
                    "Cold store rejected demoted series"
                );
            }
        }
        None => {
            debug!(
                target: "tephra::cache",
                series = id,
                "No cold store configured; dropping demoted series"
            );
        }
    }
}

/// `len >= 90%` of capacity counts as "near full" for demotion pressure.
fn near_full(cache: &LruCache) -> bool {
    cache.len() * 10 >= cache.max_entries() * 9
}

fn maintenance_pass(shared: &HierarchyShared) {
    let _guard = shared.cross_level.lock();
    let config = &shared.config;

    // Snapshot both id sets up front so every entry moves at most once
    // per pass (an entry demoted out of L1 must not be demoted again out
    // of L2 in the same pass).
    let l1_ids = shared.l1.series_ids();
    let l2_ids = shared
        .l2
        .as_ref()
        .map(|l2| l2.series_ids())
        .unwrap_or_default();

    // L2 → L1 promotions.
    if let Some(l2) = &shared.l2 {
        for &id in &l2_ids {
            if let Some(meta) = l2.metadata(id) {
                if meta.access_count > config.l1_promotion_threshold && !shared.l1.is_full() {
                    promote_to_l1(shared, id);
                }
            }
        }
    }

    // L1 → L2 demotions (or straight to cold with no L2).
    let l1_pressure = near_full(&shared.l1);
    for id in l1_ids {
        if let Some(meta) = shared.l1.metadata(id) {
            let idle = meta.idle_for();
            let eligible = meta.access_count < config.l1_demotion_threshold
                || idle >= Duration::from_secs(config.l1_demotion_timeout_secs)
                || l1_pressure;
            if !eligible {
                continue;
            }

            match &shared.l2 {
                Some(l2) if !l2.is_full() => {
                    if let Some(series) = shared.l1.take(id) {
                        l2.put(id, series);
                        shared.counters.demotions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Some(_) => {} // L2 full: leave the entry; put-path cascade handles overflow
                None => {
                    if let Some(series) = shared.l1.take(id) {
                        persist_to_cold(shared, id, &series);
                        shared.counters.demotions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    // L2 → cold demotions.
    if let Some(l2) = &shared.l2 {
        for id in l2_ids {
            if let Some(meta) = l2.metadata(id) {
                let idle = meta.idle_for();
                if meta.access_count < config.l2_demotion_threshold
                    && idle >= Duration::from_secs(config.l2_demotion_timeout_secs)
                {
                    if let Some(series) = l2.take(id) {
                        persist_to_cold(shared, id, &series);
                        shared.counters.demotions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

fn background_loop(shared: Arc<HierarchyShared>) {
    let interval = Duration::from_millis(shared.config.background_interval_ms);
    loop {
        {
            let mut stop = shared.shutdown.lock();
            if *stop {
                break;
            }
            let _ = shared.shutdown_cv.wait_for(&mut stop, interval);
            if *stop {
                break;
            }
        }
        maintenance_pass(&shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheLevelConfig;
    use tephra_core::Labels;

    fn series(name: &str) -> Arc<TimeSeries> {
        let labels = Labels::from_pairs([("metric", name)].iter().copied()).unwrap();
        let mut ts = TimeSeries::new(labels);
        ts.push(1000, 1.0).unwrap();
        Arc::new(ts)
    }

    fn quiet_config(l1: usize, l2: Option<usize>) -> CacheHierarchyConfig {
        CacheHierarchyConfig {
            l1: CacheLevelConfig::with_max_entries(l1),
            l2: l2.map(CacheLevelConfig::with_max_entries),
            enable_background_processing: false,
            ..CacheHierarchyConfig::default()
        }
    }

    struct CountingColdStore {
        persisted: Mutex<Vec<SeriesId>>,
    }

    impl CountingColdStore {
        fn new() -> Arc<Self> {
            Arc::new(CountingColdStore {
                persisted: Mutex::new(Vec::new()),
            })
        }
    }

    impl ColdStore for CountingColdStore {
        fn persist(&self, id: SeriesId, _series: &TimeSeries) -> bool {
            self.persisted.lock().push(id);
            true
        }
    }

    #[test]
    fn test_put_get_through_l1() {
        let h = CacheHierarchy::new(quiet_config(4, Some(8))).unwrap();
        h.put(1, series("a"));
        assert!(h.get(1).is_some());

        let stats = h.stats_snapshot();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 0);
    }

    #[test]
    fn test_miss_counts() {
        let h = CacheHierarchy::new(quiet_config(4, Some(8))).unwrap();
        assert!(h.get(42).is_none());
        assert_eq!(h.stats_snapshot().total_misses, 1);
        assert_eq!(h.hit_ratio(), 0.0);
    }

    #[test]
    fn test_put_spills_to_l2_when_l1_full() {
        let h = CacheHierarchy::new(quiet_config(2, Some(8))).unwrap();
        h.put(1, series("a"));
        h.put(2, series("b"));
        h.put(3, series("c"));

        assert_eq!(h.l1().len(), 2);
        assert_eq!(h.l2().unwrap().len(), 1);
        assert!(h.get(3).is_some());
        assert_eq!(h.stats_snapshot().l2_hits, 1);
    }

    #[test]
    fn test_cascade_when_both_levels_full() {
        // L1 cap 2, L2 cap 10: fill L1 with 1,2; put(3) spills 3 to L2;
        // then fill L2; the next put evicts the L1 LRU into L2 and L2's
        // LRU to the cold store.
        let cold = CountingColdStore::new();
        let h = CacheHierarchy::new(quiet_config(2, Some(2))).unwrap();
        h.set_cold_store(cold.clone());

        h.put(1, series("a"));
        h.put(2, series("b"));
        h.put(3, series("c")); // L2: [3]
        h.put(4, series("d")); // L2: [4,3]
        h.put(5, series("e")); // cascade: L2 evicts 3 to cold, L1 evicts 1 into L2

        assert_eq!(cold.persisted.lock().as_slice(), &[3]);
        assert!(h.get(5).is_some());
        assert!(h.get(2).is_some());
        assert!(h.get(1).is_some()); // moved to L2, still reachable
        assert!(h.get(4).is_some());
        assert!(h.get(3).is_none()); // surrendered to cold store
    }

    #[test]
    fn test_hierarchy_cascade_keeps_all_reachable() {
        // With L1 cap 2 and roomy L2: ids 1..4 all stay reachable, the
        // displaced ones from L2.
        let h = CacheHierarchy::new(quiet_config(2, Some(10))).unwrap();
        for id in 1..=4u64 {
            h.put(id, series(&format!("m{}", id)));
        }
        for id in 1..=4u64 {
            assert!(h.get(id).is_some(), "id {} must be reachable", id);
        }
    }

    #[test]
    fn test_put_merge_updates_in_place() {
        let h = CacheHierarchy::new(quiet_config(2, Some(4))).unwrap();
        h.put(1, series("a"));
        h.put(2, series("b"));
        h.put(3, series("c")); // 3 lands in L2

        // Updating id 3 must merge into its L2 entry, not insert into L1.
        let mut update = TimeSeries::new(
            Labels::from_pairs([("metric", "c")].iter().copied()).unwrap(),
        );
        update.push(2000, 2.0).unwrap();
        h.put(3, Arc::new(update));

        assert_eq!(h.l1().len(), 2);
        let got = h.get(3).unwrap();
        assert_eq!(got.samples().len(), 2);
    }

    #[test]
    fn test_promotion_after_threshold_hits() {
        let mut config = quiet_config(4, Some(4));
        config.l1_promotion_threshold = 2;
        let h = CacheHierarchy::new(config).unwrap();

        // Force id 1 into L2 by filling L1 first.
        for id in 10..14u64 {
            h.put(id, series(&format!("fill{}", id)));
        }
        h.put(1, series("hot"));
        assert!(h.l2().unwrap().metadata(1).is_some());

        // Two hits reach the threshold; the third finds L1 has room after
        // we clear space, and promotes.
        h.get(1);
        h.get(1);
        h.remove(10);
        h.get(1);

        assert!(h.l1().metadata(1).is_some(), "series must live in L1 now");
        assert!(h.l2().unwrap().metadata(1).is_none());
        assert_eq!(h.stats_snapshot().promotions, 1);
    }

    #[test]
    fn test_maintenance_demotes_idle_entries() {
        let mut config = quiet_config(4, Some(8));
        config.l1_demotion_threshold = 1; // cold entries (0 accesses) are eligible
        config.l1_demotion_timeout_secs = 3600;
        let h = CacheHierarchy::new(config).unwrap();

        h.put(1, series("idle"));
        assert!(h.l1().metadata(1).is_some());

        h.maintain();

        assert!(h.l1().metadata(1).is_none());
        assert!(h.l2().unwrap().metadata(1).is_some());
        assert_eq!(h.stats_snapshot().demotions, 1);
    }

    #[test]
    fn test_maintenance_demotes_l2_to_cold() {
        let cold = CountingColdStore::new();
        let mut config = quiet_config(4, Some(8));
        config.l1_demotion_threshold = 1;
        config.l2_demotion_threshold = 1;
        config.l2_demotion_timeout_secs = 0; // immediately idle
        let h = CacheHierarchy::new(config).unwrap();
        h.set_cold_store(cold.clone());

        h.put(1, series("cold-bound"));
        h.maintain(); // L1 → L2
        h.maintain(); // L2 → cold

        assert!(!h.contains(1));
        assert_eq!(cold.persisted.lock().as_slice(), &[1]);
        assert_eq!(h.stats_snapshot().demotions, 2);
    }

    #[test]
    fn test_no_l2_demotes_straight_to_cold() {
        let cold = CountingColdStore::new();
        let mut config = quiet_config(2, None);
        config.l1_demotion_threshold = 1;
        let h = CacheHierarchy::new(config).unwrap();
        h.set_cold_store(cold.clone());

        h.put(1, series("a"));
        h.maintain();

        assert!(!h.contains(1));
        assert_eq!(cold.persisted.lock().len(), 1);
    }

    #[test]
    fn test_remove_spans_levels() {
        let h = CacheHierarchy::new(quiet_config(2, Some(4))).unwrap();
        h.put(1, series("a"));
        h.put(2, series("b"));
        h.put(3, series("c")); // in L2

        assert!(h.remove(3));
        assert!(!h.remove(3));
        assert!(h.get(3).is_none());
    }

    #[test]
    fn test_background_thread_lifecycle() {
        let mut config = quiet_config(4, Some(8));
        config.enable_background_processing = true;
        config.background_interval_ms = 10;
        let h = CacheHierarchy::new(config).unwrap();

        assert!(h.is_background_processing_running());
        h.stop_background_processing();
        assert!(!h.is_background_processing_running());
    }

    #[test]
    fn test_clear_resets_everything() {
        let h = CacheHierarchy::new(quiet_config(2, Some(4))).unwrap();
        h.put(1, series("a"));
        h.get(1);
        h.clear();

        assert!(h.get(1).is_none());
        // clear zeroes counters; the one miss above is all that remains
        assert_eq!(h.stats_snapshot().total_misses, 1);
        assert_eq!(h.stats_snapshot().total_hits, 0);
    }

    #[test]
    fn test_stats_rendering() {
        let h = CacheHierarchy::new(quiet_config(2, Some(4))).unwrap();
        h.put(1, series("a"));
        h.get(1);
        let text = h.stats();
        assert!(text.contains("Cache Hierarchy Statistics"));
        assert!(text.contains("L1:"));
        assert!(text.contains("L2:"));
    }
}
