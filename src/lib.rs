//! # Tephra
//!
//! An embedded time-series storage core built around two subsystems:
//!
//! - a **sharded write-ahead log** — every accepted sample is persisted
//!   before acknowledgement and replayed faithfully after a crash, torn
//!   tail records included
//! - a **tiered hot-data cache** — L1/L2 in-memory LRU levels plus a
//!   cold-store callback, with promotion, demotion, and an optional
//!   predictive prefetcher
//!
//! # Quick Start
//!
//! ```no_run
//! use tephra::{Labels, Storage, StorageConfig, StorageEngine, TimeSeries};
//!
//! fn main() -> tephra::Result<()> {
//!     let config = StorageConfig::new("./data");
//!     let engine = StorageEngine::open(&config)?;
//!
//!     let labels = Labels::from_pairs([("metric", "cpu"), ("host", "a")])?;
//!     let mut series = TimeSeries::new(labels.clone());
//!     series.push(1_700_000_000_000, 0.42)?;
//!
//!     engine.write(&series)?;
//!     engine.flush()?; // durable from here on
//!
//!     let hot = engine.read(&labels, 0, i64::MAX)?;
//!     assert!(hot.is_some());
//!
//!     engine.close()?;
//!     Ok(())
//! }
//! ```

pub use tephra_core::{Error, Labels, Result, Sample, SeriesId, TimeSeries, Timestamp, Value};

pub use tephra_durability::{ShardedWal, WalConfig, WalShard, WalStats};

pub use tephra_cache::{
    CacheHierarchy, CacheHierarchyConfig, CacheLevelConfig, ColdStore, LruCache, PredictiveCache,
    PredictiveCacheConfig,
};

pub use tephra_engine::{
    DerivedMetricManager, DerivedMetricRule, FilteringStorage, LabelMatch, QueryEngine,
    RuleEvaluation, RuleManager, RuleSet, Storage, StorageConfig, StorageEngine,
};
