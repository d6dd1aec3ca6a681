//! Label sets, samples, and time series.
//!
//! A time series is identified by its label set. The 64-bit [`SeriesId`]
//! is derived deterministically from the labels so that two processes
//! observing the same label set agree on identity (and therefore on WAL
//! shard placement) without any coordination.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch, signed.
pub type Timestamp = i64;

/// Sample value. NaN and ±∞ are legal values, not errors.
pub type Value = f64;

/// Runtime identity of a series, derived from its label set.
pub type SeriesId = u64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Golden-ratio mixing constant used when folding label hashes together.
const HASH_MIX: u64 = 0x9e37_79b9;

/// FNV-1a over a byte string. Used instead of the std hasher because the
/// result must be identical across processes and builds.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A label set: unique non-empty names mapped to values.
///
/// Backed by a `BTreeMap`, so iteration is always in key-sorted order and
/// two label sets with the same contents hash identically regardless of
/// insertion order. Equality and ordering are lexicographic over the
/// sorted pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels {
    labels: BTreeMap<String, String>,
}

impl Labels {
    /// Create an empty label set.
    pub fn new() -> Self {
        Labels::default()
    }

    /// Build a label set from `(name, value)` pairs.
    ///
    /// Returns `InvalidArgument` if any name is empty.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = Labels::new();
        for (k, v) in pairs {
            labels.add(k, v)?;
        }
        Ok(labels)
    }

    /// Add a label, replacing any existing value for the same name.
    ///
    /// Returns `InvalidArgument` if the name is empty.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "label name cannot be empty".to_string(),
            ));
        }
        self.labels.insert(name, value.into());
        Ok(())
    }

    /// Remove a label by name.
    pub fn remove(&mut self, name: &str) {
        self.labels.remove(name);
    }

    /// Check whether a label name is present.
    pub fn has(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    /// Look up a label value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Iterate over `(name, value)` pairs in key-sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Derive the deterministic 64-bit identity of this label set.
    ///
    /// A rolling hash over the key-sorted pairs: each key and value is
    /// hashed with FNV-1a and folded in with golden-ratio mixing. The same
    /// label set always yields the same id, in any process, which is what
    /// keeps WAL shard placement stable across restarts.
    pub fn id(&self) -> SeriesId {
        let mut h: u64 = 0;
        for (k, v) in &self.labels {
            h ^= fnv1a(k.as_bytes())
                .wrapping_add(HASH_MIX)
                .wrapping_add(h << 6)
                .wrapping_add(h >> 2);
            h ^= fnv1a(v.as_bytes())
                .wrapping_add(HASH_MIX)
                .wrapping_add(h << 6)
                .wrapping_add(h >> 2);
        }
        h
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (name, value) in &self.labels {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", name, value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// A single observation: timestamp in milliseconds plus a float value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp: Timestamp,
    /// Observed value.
    pub value: Value,
}

impl Sample {
    /// Create a new sample.
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Sample { timestamp, value }
    }
}

/// A label set plus an ordered sequence of samples.
///
/// Samples are appended in non-decreasing timestamp order within a single
/// writer; duplicate timestamps are permitted (the query layer decides
/// policy on those).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    labels: Labels,
    samples: Vec<Sample>,
}

impl TimeSeries {
    /// Create an empty series with the given labels.
    pub fn new(labels: Labels) -> Self {
        TimeSeries {
            labels,
            samples: Vec::new(),
        }
    }

    /// Assemble a series from parts without ordering checks.
    ///
    /// Used by WAL decode, where the sample order is whatever was durably
    /// written and must be reproduced as-is.
    pub fn from_parts(labels: Labels, samples: Vec<Sample>) -> Self {
        TimeSeries { labels, samples }
    }

    /// Append a sample.
    ///
    /// Returns `InvalidArgument` if the timestamp is strictly older than
    /// the last appended sample. Equal timestamps are accepted.
    pub fn push_sample(&mut self, sample: Sample) -> Result<()> {
        if let Some(last) = self.samples.last() {
            if sample.timestamp < last.timestamp {
                return Err(Error::InvalidArgument(format!(
                    "sample timestamp {} is older than last timestamp {}",
                    sample.timestamp, last.timestamp
                )));
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Append a `(timestamp, value)` pair.
    pub fn push(&mut self, timestamp: Timestamp, value: Value) -> Result<()> {
        self.push_sample(Sample::new(timestamp, value))
    }

    /// The series' label set.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// The sample sequence, oldest first.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Timestamp of the newest sample, if any.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Derived identity of this series (see [`Labels::id`]).
    pub fn series_id(&self) -> SeriesId {
        self.labels.id()
    }

    /// Whether the series holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Drop all samples, keeping the labels.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Approximate in-memory footprint in bytes.
    ///
    /// Labels are costed at a flat 32 bytes each, samples at their wire
    /// size, plus a fixed struct overhead. Used for cache byte budgets and
    /// eviction decisions, not exact accounting.
    pub fn approx_size_bytes(&self) -> usize {
        const FIXED_OVERHEAD: usize = 64;
        self.labels.len() * 32 + self.samples.len() * std::mem::size_of::<Sample>() + FIXED_OVERHEAD
    }
}
