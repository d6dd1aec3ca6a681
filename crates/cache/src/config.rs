//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Capacity limits for one in-memory cache level.
///
/// Either limit triggers eviction: entry count always applies, the byte
/// budget only when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLevelConfig {
    /// Maximum number of entries.
    pub max_entries: usize,

    /// Optional byte budget over the approximate series sizes.
    pub max_bytes: Option<usize>,
}

impl CacheLevelConfig {
    /// Entry-count-only limit.
    pub fn with_max_entries(max_entries: usize) -> Self {
        CacheLevelConfig {
            max_entries,
            max_bytes: None,
        }
    }

    /// Add a byte budget (builder pattern).
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// Configuration for the hierarchical cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHierarchyConfig {
    /// L1 limits (fastest, smallest).
    pub l1: CacheLevelConfig,

    /// L2 limits; `None` disables the mid tier entirely.
    pub l2: Option<CacheLevelConfig>,

    /// Advisory path for the L2 tier. The current L2 is a second in-memory
    /// LRU; the path is carried through config for deployments that pin a
    /// storage location anyway.
    pub l2_storage_path: Option<PathBuf>,

    /// Access count above which an L2 entry is promoted to L1.
    pub l1_promotion_threshold: u64,

    /// Access count above which a cold-store read would enter L2.
    pub l2_promotion_threshold: u64,

    /// Access count below which an L1 entry is eligible for demotion.
    pub l1_demotion_threshold: u64,

    /// Access count below which an L2 entry is eligible for demotion.
    pub l2_demotion_threshold: u64,

    /// Idle time after which an L1 entry is demoted regardless of count.
    pub l1_demotion_timeout_secs: u64,

    /// Idle time after which an L2 entry is surrendered to the cold store.
    pub l2_demotion_timeout_secs: u64,

    /// Whether to run the background maintenance thread.
    pub enable_background_processing: bool,

    /// Maintenance pass interval in milliseconds.
    pub background_interval_ms: u64,
}

impl Default for CacheHierarchyConfig {
    fn default() -> Self {
        CacheHierarchyConfig {
            l1: CacheLevelConfig {
                max_entries: 1000,
                max_bytes: Some(100 * 1024 * 1024),
            },
            l2: Some(CacheLevelConfig {
                max_entries: 10_000,
                max_bytes: Some(1024 * 1024 * 1024),
            }),
            l2_storage_path: None,
            l1_promotion_threshold: 5,
            l2_promotion_threshold: 2,
            l1_demotion_threshold: 2,
            l2_demotion_threshold: 1,
            l1_demotion_timeout_secs: 30,
            l2_demotion_timeout_secs: 60,
            enable_background_processing: true,
            background_interval_ms: 1000,
        }
    }
}

impl CacheHierarchyConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Small caches, no background thread: deterministic for tests.
    pub fn for_testing() -> Self {
        CacheHierarchyConfig {
            l1: CacheLevelConfig::with_max_entries(8),
            l2: Some(CacheLevelConfig::with_max_entries(32)),
            enable_background_processing: false,
            ..Self::default()
        }
    }
}

/// Configuration for predictive prefetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveCacheConfig {
    /// Maximum access-sequence length to track.
    pub max_pattern_length: usize,

    /// Minimum occurrences before a pattern carries any confidence.
    pub min_pattern_confidence: u64,

    /// Minimum confidence for a pattern to produce predictions.
    pub confidence_threshold: f64,

    /// Maximum items to prefetch per access.
    pub max_prefetch_size: usize,

    /// Scale the prefetch size with the observed success rate.
    pub enable_adaptive_prefetch: bool,

    /// Window of recent prefetch outcomes kept for the success rate.
    pub prefetch_window_size: usize,

    /// Interval for the optional pattern-GC thread, in milliseconds.
    pub cleanup_interval_ms: u64,

    /// Whether to run the pattern-GC thread.
    pub enable_background_cleanup: bool,
}

impl Default for PredictiveCacheConfig {
    fn default() -> Self {
        PredictiveCacheConfig {
            max_pattern_length: 10,
            min_pattern_confidence: 3,
            confidence_threshold: 0.7,
            max_prefetch_size: 5,
            enable_adaptive_prefetch: true,
            prefetch_window_size: 100,
            cleanup_interval_ms: 60_000,
            enable_background_cleanup: false,
        }
    }
}

impl PredictiveCacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_defaults() {
        let config = CacheHierarchyConfig::default();
        assert_eq!(config.l1.max_entries, 1000);
        assert_eq!(config.l1_promotion_threshold, 5);
        assert_eq!(config.background_interval_ms, 1000);
        assert!(config.l2.is_some());
        assert!(config.enable_background_processing);
    }

    #[test]
    fn test_testing_config_is_quiet() {
        let config = CacheHierarchyConfig::for_testing();
        assert!(!config.enable_background_processing);
        assert!(config.l1.max_entries < CacheHierarchyConfig::default().l1.max_entries);
    }

    #[test]
    fn test_level_builder() {
        let level = CacheLevelConfig::with_max_entries(10).with_max_bytes(4096);
        assert_eq!(level.max_entries, 10);
        assert_eq!(level.max_bytes, Some(4096));
    }

    #[test]
    fn test_predictive_defaults() {
        let config = PredictiveCacheConfig::default();
        assert_eq!(config.max_pattern_length, 10);
        assert_eq!(config.max_prefetch_size, 5);
        assert!(!config.enable_background_cleanup);
    }
}
