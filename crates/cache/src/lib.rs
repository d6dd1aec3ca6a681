//! Hot-data serving layer for Tephra
//!
//! A three-level cache hierarchy over time series:
//!
//! - L1: fast in-memory LRU, smallest
//! - L2: larger in-memory LRU of the same shape
//! - L3: not a data structure but a persistence callback ([`ColdStore`]),
//!   invoked when an entry is demoted out of memory entirely
//!
//! Entries are admitted by `put`, promoted and demoted by access-pattern
//! predicates, and evicted under entry-count and byte budgets. The
//! [`PredictiveCache`] learns short access sequences and emits prefetch
//! hints back into the hierarchy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entry;
pub mod hierarchy;
pub mod lru;
pub mod predictive;

pub use config::{CacheHierarchyConfig, CacheLevelConfig, PredictiveCacheConfig};
pub use entry::{CacheEntryMetadata, CacheLevel};
pub use hierarchy::{CacheHierarchy, ColdStore, HierarchyStats};
pub use lru::LruCache;
pub use predictive::PredictiveCache;
