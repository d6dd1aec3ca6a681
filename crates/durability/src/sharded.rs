//! Sharded WAL facade.
//!
//! Routes each incoming series to one of N shards by the stable label-set
//! hash, so the same series always lands on the same shard and per-series
//! write ordering needs no cross-shard coordination. Shard directories are
//! `<base_dir>/shard_NNN/`, zero-padded to 3 digits.

use crate::config::WalConfig;
use crate::encoding::encoded_len;
use crate::replay::ReplaySummary;
use crate::shard::WalShard;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tephra_core::{Labels, Result, TimeSeries};
use tracing::info;

/// Compute the shard index for a label set.
///
/// Uses the deterministic label-set hash, so placement is stable across
/// processes and restarts for any fixed label set.
pub fn shard_index(labels: &Labels, num_shards: usize) -> usize {
    (labels.id() % num_shards as u64) as usize
}

/// Directory for one shard under the WAL base directory.
pub fn shard_dir(base_dir: &Path, index: usize) -> PathBuf {
    base_dir.join(format!("shard_{:03}", index))
}

/// Point-in-time snapshot of WAL metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalStats {
    /// Accepted `log` calls.
    pub total_writes: u64,
    /// Payload bytes accepted (frame overhead excluded).
    pub total_bytes: u64,
    /// Failed `log` calls plus worker-side I/O failures.
    pub total_errors: u64,
}

#[derive(Default)]
struct WalMetrics {
    total_writes: AtomicU64,
    total_bytes: AtomicU64,
    total_errors: AtomicU64,
}

/// The sharded write-ahead log.
pub struct ShardedWal {
    shards: Vec<WalShard>,
    metrics: WalMetrics,
    base_dir: PathBuf,
}

impl ShardedWal {
    /// Open (or create) a sharded WAL under `base_dir`.
    pub fn open(base_dir: &Path, config: &WalConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| tephra_core::Error::InvalidArgument(e.to_string()))?;

        std::fs::create_dir_all(base_dir)?;

        let mut shards = Vec::with_capacity(config.shards);
        for index in 0..config.shards {
            shards.push(WalShard::open(&shard_dir(base_dir, index), config)?);
        }

        info!(
            target: "tephra::wal",
            dir = %base_dir.display(),
            shards = config.shards,
            "Opened sharded WAL"
        );

        Ok(ShardedWal {
            shards,
            metrics: WalMetrics::default(),
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Route a series to its shard and enqueue it for durable append.
    ///
    /// Blocks when that shard's queue is full.
    pub fn log(&self, series: &TimeSeries) -> Result<()> {
        let index = shard_index(series.labels(), self.shards.len());
        let bytes = encoded_len(series) as u64;

        match self.shards[index].log(series.clone()) {
            Ok(()) => {
                self.metrics.total_writes.fetch_add(1, Ordering::Relaxed);
                self.metrics.total_bytes.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Durability barrier across every shard.
    pub fn flush(&self) -> Result<()> {
        for shard in &self.shards {
            shard.flush()?;
        }
        Ok(())
    }

    /// Replay every shard in index order, invoking `callback` for each
    /// decoded series.
    ///
    /// Within a shard, callback order equals the original submission order;
    /// across shards no order is promised.
    pub fn replay(&self, callback: &mut dyn FnMut(TimeSeries)) -> Result<ReplaySummary> {
        let mut total = ReplaySummary::default();
        for shard in &self.shards {
            let summary = shard.replay(callback)?;
            total.decoded += summary.decoded;
            total.skipped += summary.skipped;
            total.damaged_segments += summary.damaged_segments;
        }

        info!(
            target: "tephra::wal",
            decoded = total.decoded,
            skipped = total.skipped,
            damaged_segments = total.damaged_segments,
            "WAL replay complete"
        );
        Ok(total)
    }

    /// Retain only the newest `keep_n` segments per shard.
    pub fn checkpoint(&self, keep_n: usize) -> Result<usize> {
        let mut deleted = 0;
        for shard in &self.shards {
            deleted += shard.checkpoint(keep_n)?;
        }
        Ok(deleted)
    }

    /// Shut every shard down, draining queues and joining workers.
    pub fn close(&self) -> Result<()> {
        for shard in &self.shards {
            shard.close()?;
        }
        Ok(())
    }

    /// Snapshot the WAL metrics, folding in worker-side I/O errors.
    pub fn stats(&self) -> WalStats {
        let worker_errors: u64 = self.shards.iter().map(|s| s.io_errors()).sum();
        WalStats {
            total_writes: self.metrics.total_writes.load(Ordering::Relaxed),
            total_bytes: self.metrics.total_bytes.load(Ordering::Relaxed),
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed) + worker_errors,
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// WAL base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Access a shard by index (used by tests to provoke backpressure).
    pub fn shard(&self, index: usize) -> &WalShard {
        &self.shards[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn series(pairs: &[(&str, &str)], ts: i64, value: f64) -> TimeSeries {
        let labels = Labels::from_pairs(pairs.iter().copied()).unwrap();
        let mut s = TimeSeries::new(labels);
        s.push(ts, value).unwrap();
        s
    }

    #[test]
    fn test_shard_index_is_stable() {
        let labels =
            Labels::from_pairs([("metric", "cpu"), ("host", "a")].iter().copied()).unwrap();
        let first = shard_index(&labels, 16);

        // Rebuilding the identical label set (different insertion order)
        // must land on the same shard.
        let mut rebuilt = Labels::new();
        rebuilt.add("host", "a").unwrap();
        rebuilt.add("metric", "cpu").unwrap();
        assert_eq!(shard_index(&rebuilt, 16), first);
    }

    #[test]
    fn test_shard_dirs_created() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing().with_shards(3);
        let wal = ShardedWal::open(dir.path(), &config).unwrap();
        assert_eq!(wal.shard_count(), 3);

        for i in 0..3 {
            assert!(shard_dir(dir.path(), i).is_dir());
        }
        assert_eq!(shard_dir(dir.path(), 7), dir.path().join("shard_007"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing().with_shards(0);
        assert!(ShardedWal::open(dir.path(), &config).is_err());
    }

    #[test]
    fn test_metrics_count_writes_and_bytes() {
        let dir = tempdir().unwrap();
        let wal = ShardedWal::open(dir.path(), &WalConfig::for_testing()).unwrap();

        let s = series(&[("metric", "cpu"), ("host", "a")], 1000, 1.0);
        wal.log(&s).unwrap();
        wal.log(&s).unwrap();
        wal.flush().unwrap();

        let stats = wal.stats();
        assert_eq!(stats.total_writes, 2);
        assert_eq!(stats.total_bytes, 2 * encoded_len(&s) as u64);
        assert_eq!(stats.total_errors, 0);
    }

    #[test]
    fn test_roundtrip_across_shards() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing();

        {
            let wal = ShardedWal::open(dir.path(), &config).unwrap();
            for i in 0..20 {
                wal.log(&series(
                    &[("metric", "cpu"), ("host", &format!("h{}", i))],
                    1000 + i,
                    i as f64,
                ))
                .unwrap();
            }
            wal.flush().unwrap();
            wal.close().unwrap();
        }

        let wal = ShardedWal::open(dir.path(), &config).unwrap();
        let mut replayed = Vec::new();
        let summary = wal.replay(&mut |s| replayed.push(s)).unwrap();
        assert_eq!(summary.decoded, 20);
        assert_eq!(replayed.len(), 20);
    }

    #[test]
    fn test_same_series_same_shard_preserves_order() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing();

        {
            let wal = ShardedWal::open(dir.path(), &config).unwrap();
            for i in 0..100 {
                wal.log(&series(&[("metric", "cpu"), ("host", "a")], 1000 + i, i as f64))
                    .unwrap();
            }
            wal.flush().unwrap();
        }

        let wal = ShardedWal::open(dir.path(), &config).unwrap();
        let mut timestamps = Vec::new();
        wal.replay(&mut |s| timestamps.push(s.samples()[0].timestamp))
            .unwrap();

        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted, "per-series order must equal submission order");
        assert_eq!(timestamps.len(), 100);
    }
}
