//! Durability layer for Tephra
//!
//! This crate handles everything that touches disk:
//!
//! - Segment writer: append-only, length-framed record files with rotation
//! - WAL shard: bounded queue + worker thread, batched fsync, tail-tolerant replay
//! - Sharded WAL: deterministic label-hash routing over N shards
//! - On-disk record encoding for time series fragments
//!
//! The contract with the layers above: once [`ShardedWal::log`] has been
//! followed by a [`ShardedWal::flush`], the accepted series survives a crash
//! and is reproduced by [`ShardedWal::replay`] in per-shard submission order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod encoding;
pub mod replay;
pub mod segment;
pub mod shard;
pub mod sharded;

pub use config::{WalConfig, WalConfigError};
pub use encoding::{decode_series, encode_series, encoded_len, DecodeError};
pub use replay::{replay_dir, ReplayStop, ReplaySummary, MAX_RECORD_LEN};
pub use segment::SegmentWriter;
pub use shard::WalShard;
pub use sharded::{shard_dir, shard_index, ShardedWal, WalStats};
