//! Drop/keep filtering in front of the write path.
//!
//! Rules live in an immutable [`RuleSet`] referenced through an atomic
//! pointer ([`arc_swap::ArcSwap`]), so the hot path takes a lock-free
//! snapshot and rule updates swap the whole set at once. Keep rules win
//! over drop rules; a dropped write reports success without reaching the
//! WAL or cache.

use crate::storage::Storage;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tephra_core::{Labels, Result, TimeSeries, Timestamp};
use tracing::debug;

/// One label equality match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatch {
    /// Label name to test.
    pub label: String,
    /// Value that must match exactly.
    pub value: String,
}

impl LabelMatch {
    /// Build a match rule.
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        LabelMatch {
            label: label.into(),
            value: value.into(),
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.label) == Some(self.value.as_str())
    }
}

/// An immutable bundle of drop and keep rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    drop: Vec<LabelMatch>,
    keep: Vec<LabelMatch>,
}

impl RuleSet {
    /// Empty rule set: everything passes.
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Add a drop rule (builder pattern).
    pub fn drop_matching(mut self, rule: LabelMatch) -> Self {
        self.drop.push(rule);
        self
    }

    /// Add a keep rule (builder pattern). Keep wins over drop.
    pub fn keep_matching(mut self, rule: LabelMatch) -> Self {
        self.keep.push(rule);
        self
    }

    /// Decide whether a series should be silently dropped.
    pub fn should_drop(&self, series: &TimeSeries) -> bool {
        let labels = series.labels();
        if self.keep.iter().any(|rule| rule.matches(labels)) {
            return false;
        }
        self.drop.iter().any(|rule| rule.matches(labels))
    }

    /// Whether the set contains no rules at all.
    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.keep.is_empty()
    }
}

/// Holds the current rule snapshot behind an atomic pointer.
pub struct RuleManager {
    current: ArcSwap<RuleSet>,
}

impl RuleManager {
    /// Start with an empty rule set.
    pub fn new() -> Self {
        RuleManager {
            current: ArcSwap::from_pointee(RuleSet::new()),
        }
    }

    /// Lock-free load of the current rules.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Atomically replace the rule set.
    pub fn install(&self, rules: RuleSet) {
        self.current.store(Arc::new(rules));
        debug!(target: "tephra::filter", "Installed new filter rule set");
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Storage`] wrapper that applies drop/keep rules before writes reach
/// the underlying engine. Reads and lifecycle calls delegate untouched.
pub struct FilteringStorage<S> {
    inner: S,
    rules: Arc<RuleManager>,
    dropped: AtomicU64,
    rule_check_nanos: AtomicU64,
}

impl<S: Storage> FilteringStorage<S> {
    /// Wrap `inner` with the given rule manager.
    pub fn new(inner: S, rules: Arc<RuleManager>) -> Self {
        FilteringStorage {
            inner,
            rules,
            dropped: AtomicU64::new(0),
            rule_check_nanos: AtomicU64::new(0),
        }
    }

    /// Number of writes silently dropped so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cumulative nanoseconds spent evaluating rules.
    pub fn rule_check_nanos(&self) -> u64 {
        self.rule_check_nanos.load(Ordering::Relaxed)
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Storage> Storage for FilteringStorage<S> {
    fn write(&self, series: &TimeSeries) -> Result<()> {
        let rules = self.rules.snapshot();

        let start = Instant::now();
        let drop = rules.should_drop(series);
        self.rule_check_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "tephra::filter",
                series = %series.labels(),
                "Dropped series by filter rule"
            );
            return Ok(());
        }

        self.inner.write(series)
    }

    fn read(
        &self,
        labels: &Labels,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<TimeSeries>> {
        self.inner.read(labels, start, end)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn stats(&self) -> String {
        let mut out = self.inner.stats();
        out.push_str(&format!(
            "Filter: dropped={} rule_check_time={}ns\n",
            self.dropped_count(),
            self.rule_check_nanos()
        ));
        out
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
