//! WAL configuration.

use serde::{Deserialize, Serialize};

/// WAL configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Number of shards (default: 16).
    ///
    /// Each shard owns one worker thread and one segment stream. A series
    /// always maps to the same shard, so per-series ordering needs no
    /// cross-shard coordination.
    pub shards: usize,

    /// Bounded queue depth per shard (default: 10,000).
    ///
    /// When a shard's queue is full, `log` blocks the producer until the
    /// worker drains. The caller's rate is the admission controller;
    /// drop-on-full would break durability acknowledgement semantics.
    pub queue_depth_per_shard: usize,

    /// Maximum segment size in bytes (default: 64 MiB).
    ///
    /// When the active segment exceeds this size after a successful append,
    /// the shard rotates to a new segment. Rotation never splits a record.
    pub segment_size_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            shards: 16,
            queue_depth_per_shard: 10_000,
            segment_size_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl WalConfig {
    /// Create a new WAL configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set shard count (builder pattern).
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set per-shard queue depth (builder pattern).
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth_per_shard = depth;
        self
    }

    /// Set segment rotation threshold (builder pattern).
    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.shards == 0 {
            return Err(WalConfigError::ZeroShards);
        }
        if self.queue_depth_per_shard == 0 {
            return Err(WalConfigError::ZeroQueueDepth);
        }
        if self.segment_size_bytes < 1024 {
            return Err(WalConfigError::SegmentSizeTooSmall);
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (few shards, small
    /// segments so rotation is cheap to trigger).
    pub fn for_testing() -> Self {
        WalConfig {
            shards: 4,
            queue_depth_per_shard: 256,
            segment_size_bytes: 64 * 1024, // 64 KiB
        }
    }
}

/// WAL configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Shard count must be at least 1.
    #[error("Shard count must be at least 1")]
    ZeroShards,

    /// Queue depth must be at least 1.
    #[error("Queue depth must be at least 1")]
    ZeroQueueDepth,

    /// Segment size is too small (minimum 1KB).
    #[error("Segment size must be at least 1KB")]
    SegmentSizeTooSmall,
}
