//! Predictive prefetching from learned access sequences.
//!
//! The cache keeps a rolling window of recent series accesses and counts
//! every contiguous subsequence (length 2 up to the configured maximum) as
//! a candidate pattern. A pattern's confidence grows with occurrences and
//! decays with time since it was last observed:
//!
//! ```text
//! confidence = min(1, occurrences / 5) × exp(−hours_since_last_seen / 24)
//! ```
//!
//! Patterns below the occurrence floor carry zero confidence. Given the
//! id just accessed, predictions are the successors of matching patterns
//! in descending confidence order, truncated to an adaptive budget driven
//! by the recent prefetch success rate.

use crate::config::PredictiveCacheConfig;
use crate::hierarchy::CacheHierarchy;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tephra_core::SeriesId;

/// Age past which a low-occurrence pattern is garbage-collected.
const PATTERN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// A detected access pattern.
#[derive(Debug, Clone)]
struct AccessPattern {
    sequence: Vec<SeriesId>,
    occurrences: u64,
    last_seen: Instant,
}

struct PatternState {
    /// Rolling window of recent accesses, bounded at
    /// `10 × max_pattern_length`.
    recent: VecDeque<SeriesId>,
    /// Patterns keyed by their canonical "id,id,…" form.
    patterns: FxHashMap<String, AccessPattern>,
}

#[derive(Default)]
struct PrefetchStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    recent_results: Mutex<VecDeque<bool>>,
}

impl PrefetchStats {
    fn success_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.successful.load(Ordering::Relaxed) as f64 / total as f64
    }

    fn record(&self, success: bool, window: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut recent = self.recent_results.lock();
        recent.push_back(success);
        while recent.len() > window {
            recent.pop_front();
        }
    }
}

/// Learns access sequences and emits prefetch hints into the hierarchy.
pub struct PredictiveCache {
    config: PredictiveCacheConfig,
    state: Mutex<PatternState>,
    stats: PrefetchStats,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    cleanup_worker: Mutex<Option<JoinHandle<()>>>,
}

impl PredictiveCache {
    /// Build a predictive cache; spawns the cleanup thread only when
    /// configured to.
    pub fn new(config: PredictiveCacheConfig) -> Arc<Self> {
        let cache = Arc::new(PredictiveCache {
            config,
            state: Mutex::new(PatternState {
                recent: VecDeque::new(),
                patterns: FxHashMap::default(),
            }),
            stats: PrefetchStats::default(),
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            cleanup_worker: Mutex::new(None),
        });

        if cache.config.enable_background_cleanup {
            // The worker holds only a weak reference so dropping the last
            // strong handle still tears the cache down.
            let weak = Arc::downgrade(&cache);
            let interval = Duration::from_millis(cache.config.cleanup_interval_ms);
            let shutdown = Arc::clone(&cache.shutdown);
            let handle = std::thread::Builder::new()
                .name("tephra-prefetch-gc".to_string())
                .spawn(move || loop {
                    {
                        let (lock, cv) = &*shutdown;
                        let mut stop = lock.lock();
                        if *stop {
                            break;
                        }
                        let _ = cv.wait_for(&mut stop, interval);
                        if *stop {
                            break;
                        }
                    }
                    match weak.upgrade() {
                        Some(cache) => cache.cleanup_old_patterns(),
                        None => break,
                    }
                });
            if let Ok(handle) = handle {
                *cache.cleanup_worker.lock() = Some(handle);
            }
        }

        cache
    }

    /// Record an access for pattern learning.
    pub fn record_access(&self, id: SeriesId) {
        let mut state = self.state.lock();

        state.recent.push_back(id);
        let window_cap = self.config.max_pattern_length * 10;
        while state.recent.len() > window_cap {
            state.recent.pop_front();
        }

        self.detect_patterns(&mut state);
    }

    /// Predictions for the series likely accessed after `current`, as
    /// `(id, confidence)` pairs in descending confidence order.
    pub fn predictions(&self, current: SeriesId) -> Vec<(SeriesId, f64)> {
        let state = self.state.lock();

        let mut predictions: Vec<(SeriesId, f64)> = state
            .patterns
            .values()
            .filter(|p| p.sequence.len() > 1 && p.sequence[0] == current)
            .filter_map(|p| {
                let confidence = self.confidence(p);
                if confidence >= self.config.confidence_threshold {
                    Some((p.sequence[1], confidence))
                } else {
                    None
                }
            })
            .collect();

        predictions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        predictions.dedup_by_key(|p| p.0);
        predictions.truncate(self.adaptive_prefetch_size());
        predictions
    }

    /// Issue prefetch hints for the series accessed after `current`.
    ///
    /// Predicted ids already resident in L1/L2 count as successful
    /// prefetches immediately. The rest are counted as attempts; the
    /// read-through that would load them lives outside the cache core,
    /// and [`PredictiveCache::record_prefetch_result`] reports whether a
    /// real access followed. Returns the number of hints issued.
    pub fn prefetch_into(&self, hierarchy: &CacheHierarchy, current: SeriesId) -> usize {
        let predictions = self.predictions(current);
        let mut issued = 0;

        for (id, _confidence) in predictions {
            if hierarchy.contains(id) {
                self.stats.record(true, self.config.prefetch_window_size);
                continue;
            }
            issued += 1;
            self.stats.record(false, self.config.prefetch_window_size);
        }

        issued
    }

    /// Report whether a prefetched series was actually accessed within
    /// the follow-up window.
    pub fn record_prefetch_result(&self, _id: SeriesId, was_accessed: bool) {
        self.stats
            .record(was_accessed, self.config.prefetch_window_size);
    }

    /// Drop patterns past the expiry ceiling that never reached the
    /// occurrence floor.
    pub fn cleanup_old_patterns(&self) {
        let floor = self.config.min_pattern_confidence;
        let mut state = self.state.lock();
        state
            .patterns
            .retain(|_, p| !(p.last_seen.elapsed() > PATTERN_EXPIRY && p.occurrences < floor));
    }

    /// Forget all learned patterns and statistics.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.recent.clear();
        state.patterns.clear();
        drop(state);

        self.stats.total.store(0, Ordering::Relaxed);
        self.stats.successful.store(0, Ordering::Relaxed);
        self.stats.failed.store(0, Ordering::Relaxed);
        self.stats.recent_results.lock().clear();
    }

    /// Recent prefetch success rate in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    /// Number of tracked patterns.
    pub fn pattern_count(&self) -> usize {
        self.state.lock().patterns.len()
    }

    /// Human-readable statistics block.
    pub fn stats(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        out.push_str("Predictive Cache Statistics:\n");
        out.push_str(&format!("  Recent Accesses: {}\n", state.recent.len()));
        out.push_str(&format!("  Tracked Patterns: {}\n", state.patterns.len()));
        out.push_str(&format!(
            "  Prefetches: total={} successful={} failed={}\n",
            self.stats.total.load(Ordering::Relaxed),
            self.stats.successful.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
        ));
        out.push_str(&format!(
            "  Success Rate: {:.2}%\n",
            self.stats.success_rate() * 100.0
        ));
        out.push_str(&format!(
            "  Adaptive Prefetch Size: {}\n",
            self.adaptive_prefetch_size()
        ));
        out
    }

    /// Stop the cleanup thread, if one is running.
    pub fn close(&self) {
        let handle = {
            let mut worker = self.cleanup_worker.lock();
            let (lock, cv) = &*self.shutdown;
            *lock.lock() = true;
            cv.notify_all();
            worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Prefetch budget scaled by the recent success rate.
    ///
    /// >0.8 earns two extra slots (clamped at the configured max), >0.6
    /// keeps the max, >0.4 gives one slot back, anything worse gives two;
    /// the floor is a single slot.
    fn adaptive_prefetch_size(&self) -> usize {
        let max = self.config.max_prefetch_size;
        if !self.config.enable_adaptive_prefetch {
            return max;
        }

        let rate = self.stats.success_rate();
        let adjusted = if rate > 0.8 {
            max as i64 + 2
        } else if rate > 0.6 {
            max as i64
        } else if rate > 0.4 {
            max as i64 - 1
        } else {
            max as i64 - 2
        };
        adjusted.clamp(1, max as i64) as usize
    }

    fn confidence(&self, pattern: &AccessPattern) -> f64 {
        if pattern.occurrences < self.config.min_pattern_confidence {
            return 0.0;
        }
        let base = (pattern.occurrences as f64 / 5.0).min(1.0);
        let hours = pattern.last_seen.elapsed().as_secs_f64() / 3600.0;
        base * (-hours / 24.0).exp()
    }

    /// Count every contiguous subsequence of the rolling window.
    fn detect_patterns(&self, state: &mut PatternState) {
        let sequence: Vec<SeriesId> = state.recent.iter().copied().collect();
        let max_len = self.config.max_pattern_length.min(sequence.len());

        for pattern_length in 2..=max_len {
            for start in 0..=(sequence.len() - pattern_length) {
                let window = &sequence[start..start + pattern_length];
                let key = pattern_key(window);

                match state.patterns.get_mut(&key) {
                    Some(pattern) => {
                        pattern.occurrences += 1;
                        pattern.last_seen = Instant::now();
                    }
                    None => {
                        state.patterns.insert(
                            key,
                            AccessPattern {
                                sequence: window.to_vec(),
                                occurrences: 1,
                                last_seen: Instant::now(),
                            },
                        );
                    }
                }
            }
        }
    }
}

impl Drop for PredictiveCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn pattern_key(sequence: &[SeriesId]) -> String {
    let mut key = String::with_capacity(sequence.len() * 4);
    for (i, id) in sequence.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(&id.to_string());
    }
    key
}
