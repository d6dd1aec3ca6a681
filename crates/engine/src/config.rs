//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tephra_cache::{CacheHierarchyConfig, PredictiveCacheConfig};
use tephra_durability::WalConfig;

/// Top-level storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base data directory; the WAL lives under `<data_dir>/wal`.
    pub data_dir: PathBuf,

    /// Write-ahead log knobs.
    pub wal: WalConfig,

    /// Cache hierarchy knobs.
    pub cache: CacheHierarchyConfig,

    /// Predictive prefetcher knobs; `None` disables prediction.
    pub predictive: Option<PredictiveCacheConfig>,
}

impl StorageConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StorageConfig {
            data_dir: data_dir.into(),
            wal: WalConfig::default(),
            cache: CacheHierarchyConfig::default(),
            predictive: Some(PredictiveCacheConfig::default()),
        }
    }

    /// Small, deterministic configuration for tests: few shards, small
    /// caches, no background threads.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        StorageConfig {
            data_dir: data_dir.into(),
            wal: WalConfig::for_testing(),
            cache: CacheHierarchyConfig::for_testing(),
            predictive: Some(PredictiveCacheConfig::default()),
        }
    }

    /// Directory the sharded WAL lives in.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_dir_is_under_data_dir() {
        let config = StorageConfig::new("/data/tephra");
        assert_eq!(config.wal_dir(), PathBuf::from("/data/tephra/wal"));
    }

    #[test]
    fn test_testing_config_disables_background_work() {
        let config = StorageConfig::for_testing("/tmp/x");
        assert!(!config.cache.enable_background_processing);
        assert!(config.wal.shards < WalConfig::default().shards);
    }
}
