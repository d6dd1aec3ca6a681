//! Storage engine for Tephra
//!
//! Composes the durability and caching layers into the storage surface
//! the rest of the system talks to:
//!
//! - [`StorageEngine`]: write-ahead-logged, cache-fronted series storage
//!   with replay-on-open
//! - [`FilteringStorage`]: drop/keep rule evaluation in front of any
//!   [`Storage`], with lock-free rule snapshots
//! - [`DerivedMetricManager`]: periodic expression evaluation feeding
//!   results back through the write path
//!
//! The write contract: once `write` returns `Ok`, the sample is in the
//! cache and enqueued in the WAL; once `flush` returns `Ok`, it is
//! durable and will be reproduced by replay after a crash.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod derived;
pub mod filter;
pub mod storage;

pub use config::StorageConfig;
pub use derived::{DerivedMetricManager, DerivedMetricRule, RuleEvaluation};
pub use filter::{FilteringStorage, LabelMatch, RuleManager, RuleSet};
pub use storage::{QueryEngine, Storage, StorageEngine};

pub use tephra_cache::ColdStore;
