//! The storage engine: WAL-backed, cache-fronted series storage.

use crate::config::StorageConfig;
use std::sync::Arc;
use tephra_cache::{CacheHierarchy, ColdStore, PredictiveCache};
use tephra_core::{Error, Labels, Result, Sample, TimeSeries, Timestamp};
use tephra_durability::ShardedWal;
use tracing::info;

/// The storage surface the engine exposes upward.
///
/// `write` is durable once `flush` has returned; a `read` miss is `None`,
/// not an error.
pub trait Storage: Send + Sync {
    /// Accept a series fragment into the engine.
    fn write(&self, series: &TimeSeries) -> Result<()>;

    /// Point query: samples of one series within `[start, end]`.
    fn read(&self, labels: &Labels, start: Timestamp, end: Timestamp)
        -> Result<Option<TimeSeries>>;

    /// Durability barrier for every pending write.
    fn flush(&self) -> Result<()>;

    /// Human-readable observability summary.
    fn stats(&self) -> String;

    /// Flush, stop background work, and release resources.
    fn close(&self) -> Result<()>;
}

/// Evaluation seam for the derived-metric scheduler.
///
/// Implemented by the external query engine; the storage core only
/// consumes results.
pub trait QueryEngine: Send + Sync {
    /// Evaluate an expression at one instant.
    fn execute_instant(&self, expr: &str, ts: Timestamp) -> Result<Vec<(Labels, Sample)>>;

    /// Evaluate an expression over a range with the given step.
    fn execute_range(
        &self,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        step_ms: i64,
    ) -> Result<Vec<(Labels, Vec<Sample>)>>;
}

/// WAL + cache composition with replay-on-open.
pub struct StorageEngine {
    wal: ShardedWal,
    cache: CacheHierarchy,
    predictive: Option<Arc<PredictiveCache>>,
}

impl StorageEngine {
    /// Open the engine: build the cache, open the sharded WAL, and replay
    /// every shard through the cache's merge path.
    ///
    /// Replay re-applies each decoded fragment exactly the way `write`
    /// does, minus the WAL append (it is already durable); the strictly-
    /// newer merge makes re-application idempotent.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let cache = CacheHierarchy::new(config.cache.clone())?;
        let wal = ShardedWal::open(&config.wal_dir(), &config.wal)?;

        let summary = wal.replay(&mut |series| {
            let id = series.series_id();
            cache.put(id, Arc::new(series));
        })?;

        info!(
            target: "tephra::engine",
            replayed = summary.decoded,
            skipped = summary.skipped,
            "Storage engine opened"
        );

        let predictive = config
            .predictive
            .as_ref()
            .map(|p| PredictiveCache::new(p.clone()));

        Ok(StorageEngine {
            wal,
            cache,
            predictive,
        })
    }

    /// Install the cold-store callback used for cache demotions.
    pub fn set_cold_store(&self, store: Arc<dyn ColdStore>) {
        self.cache.set_cold_store(store);
    }

    /// The cache hierarchy (exposed for prefetch integration and tests).
    pub fn cache(&self) -> &CacheHierarchy {
        &self.cache
    }

    /// WAL metrics snapshot.
    pub fn wal_stats(&self) -> tephra_durability::WalStats {
        self.wal.stats()
    }

    /// Retain only the newest `keep_n` WAL segments per shard.
    ///
    /// Callers checkpoint after the block layer has made older data
    /// durable elsewhere.
    pub fn checkpoint(&self, keep_n: usize) -> Result<usize> {
        self.wal.checkpoint(keep_n)
    }
}

impl Storage for StorageEngine {
    /// Accept one series fragment.
    ///
    /// The cache is updated synchronously before the WAL enqueue returns,
    /// so the write is immediately visible to readers; the WAL
    /// acknowledgement is what makes it recoverable. A crash between the
    /// two loses only transient cache state — replay plus merge
    /// reconstructs it.
    fn write(&self, series: &TimeSeries) -> Result<()> {
        if series.labels().is_empty() {
            return Err(Error::InvalidArgument(
                "series must carry at least one label".to_string(),
            ));
        }

        let id = series.series_id();
        self.cache.put(id, Arc::new(series.clone()));
        self.wal.log(series)?;
        Ok(())
    }

    fn read(
        &self,
        labels: &Labels,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<TimeSeries>> {
        if start > end {
            return Err(Error::InvalidArgument(format!(
                "invalid time range: start {} > end {}",
                start, end
            )));
        }

        let id = labels.id();

        if let Some(predictive) = &self.predictive {
            predictive.record_access(id);
            predictive.prefetch_into(&self.cache, id);
        }

        match self.cache.get(id) {
            Some(series) => {
                let samples: Vec<Sample> = series
                    .samples()
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp <= end)
                    .copied()
                    .collect();
                Ok(Some(TimeSeries::from_parts(labels.clone(), samples)))
            }
            // Full miss: the caller reads through to external storage.
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<()> {
        self.wal.flush()
    }

    fn stats(&self) -> String {
        let wal = self.wal.stats();
        let mut out = String::new();
        out.push_str("WAL Statistics:\n");
        out.push_str(&format!(
            "  writes={} bytes={} errors={} shards={}\n",
            wal.total_writes,
            wal.total_bytes,
            wal.total_errors,
            self.wal.shard_count()
        ));
        out.push_str(&self.cache.stats());
        if let Some(predictive) = &self.predictive {
            out.push_str(&predictive.stats());
        }
        out
    }

    fn close(&self) -> Result<()> {
        self.wal.flush()?;
        self.wal.close()?;
        self.cache.stop_background_processing();
        if let Some(predictive) = &self.predictive {
            predictive.close();
        }
        info!(target: "tephra::engine", "Storage engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().copied()).unwrap()
    }

    fn series(pairs: &[(&str, &str)], samples: &[(i64, f64)]) -> TimeSeries {
        let mut ts = TimeSeries::new(labels(pairs));
        for &(t, v) in samples {
            ts.push(t, v).unwrap();
        }
        ts
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();

        engine
            .write(&series(&[("metric", "cpu"), ("host", "a")], &[(1000, 1.0)]))
            .unwrap();

        let got = engine
            .read(&labels(&[("metric", "cpu"), ("host", "a")]), 0, 10_000)
            .unwrap()
            .expect("series must be readable right after write");
        assert_eq!(got.samples().len(), 1);
        assert_eq!(got.samples()[0].value, 1.0);

        engine.close().unwrap();
    }

    #[test]
    fn test_write_rejects_unlabelled_series() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();

        let err = engine
            .write(&TimeSeries::new(Labels::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_read_filters_time_range() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();

        engine
            .write(&series(
                &[("metric", "cpu")],
                &[(1000, 1.0), (2000, 2.0), (3000, 3.0)],
            ))
            .unwrap();

        let got = engine
            .read(&labels(&[("metric", "cpu")]), 1500, 2500)
            .unwrap()
            .unwrap();
        assert_eq!(got.samples().len(), 1);
        assert_eq!(got.samples()[0].timestamp, 2000);
    }

    #[test]
    fn test_read_rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();
        let err = engine
            .read(&labels(&[("metric", "cpu")]), 100, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_read_miss_is_none_not_error() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();
        let got = engine
            .read(&labels(&[("metric", "absent")]), 0, 100)
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_stats_sections() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(&StorageConfig::for_testing(dir.path())).unwrap();
        let text = engine.stats();
        assert!(text.contains("WAL Statistics"));
        assert!(text.contains("Cache Hierarchy Statistics"));
        assert!(text.contains("Predictive Cache Statistics"));
    }
}
