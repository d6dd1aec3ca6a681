//! Derived metrics: saved expressions evaluated on a schedule.
//!
//! Each rule names an expression, an interval, and optional label
//! filtering; results re-enter the ordinary write path with `__name__`
//! rewritten to the rule name. Evaluation errors never surface upward:
//! they drive exponential backoff (`2^failures` seconds, capped at 300)
//! and the rule recovers on its next success.

use crate::storage::{QueryEngine, Storage};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tephra_core::{Labels, Result, Sample, TimeSeries, Timestamp};
use tracing::{debug, info, warn};

/// Scheduler tick interval.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling on evaluation backoff, in seconds.
const MAX_BACKOFF_SECS: u64 = 300;

/// How a rule's expression is evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEvaluation {
    /// One instant evaluation at the scheduling time.
    Instant,
    /// Range evaluation over a trailing window.
    Range {
        /// Window length in milliseconds.
        window_ms: i64,
        /// Step between evaluation points in milliseconds.
        step_ms: i64,
    },
}

/// One derived-metric rule.
#[derive(Debug, Clone)]
pub struct DerivedMetricRule {
    /// Output metric name; written into `__name__` on every result.
    pub name: String,
    /// Expression handed to the query engine.
    pub expr: String,
    /// Evaluation interval in milliseconds.
    pub interval_ms: i64,
    /// Instant or range evaluation.
    pub evaluation: RuleEvaluation,
    /// When non-empty, only these label names survive onto results.
    pub keep_labels: Vec<String>,
    /// When `keep_labels` is empty, these label names are stripped.
    pub drop_labels: Vec<String>,
    /// Results older than this are skipped.
    pub staleness_threshold_ms: Option<i64>,

    last_execution_ms: i64,
    consecutive_failures: u32,
    backoff_until_ms: i64,
}

impl DerivedMetricRule {
    /// Instant-evaluation rule.
    pub fn instant(name: impl Into<String>, expr: impl Into<String>, interval_ms: i64) -> Self {
        DerivedMetricRule {
            name: name.into(),
            expr: expr.into(),
            interval_ms,
            evaluation: RuleEvaluation::Instant,
            keep_labels: Vec::new(),
            drop_labels: Vec::new(),
            staleness_threshold_ms: None,
            last_execution_ms: 0,
            consecutive_failures: 0,
            backoff_until_ms: 0,
        }
    }

    /// Range-evaluation rule over a trailing window.
    pub fn range(
        name: impl Into<String>,
        expr: impl Into<String>,
        interval_ms: i64,
        window_ms: i64,
        step_ms: i64,
    ) -> Self {
        let mut rule = Self::instant(name, expr, interval_ms);
        rule.evaluation = RuleEvaluation::Range { window_ms, step_ms };
        rule
    }

    /// Restrict result labels to this keep-list (wins over drop).
    pub fn with_keep_labels(mut self, labels: Vec<String>) -> Self {
        self.keep_labels = labels;
        self
    }

    /// Strip these labels from results.
    pub fn with_drop_labels(mut self, labels: Vec<String>) -> Self {
        self.drop_labels = labels;
        self
    }

    /// Skip result samples older than the threshold.
    pub fn with_staleness_threshold(mut self, threshold_ms: i64) -> Self {
        self.staleness_threshold_ms = Some(threshold_ms);
        self
    }

    fn record_failure(&mut self, now_ms: i64) -> u64 {
        self.consecutive_failures += 1;
        let backoff_secs = 1u64
            .checked_shl(self.consecutive_failures)
            .map(|v| v.min(MAX_BACKOFF_SECS))
            .unwrap_or(MAX_BACKOFF_SECS);
        self.backoff_until_ms = now_ms + (backoff_secs * 1000) as i64;
        backoff_secs
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until_ms = 0;
    }
}

/// A named group of rules sharing one interval; rules inside a group run
/// sequentially, and one rule's failure does not stop the others.
#[derive(Debug, Clone)]
struct RuleGroup {
    name: String,
    interval_ms: i64,
    rules: Vec<DerivedMetricRule>,
    last_execution_ms: i64,
}

#[derive(Default)]
struct RuleTables {
    rules: Vec<DerivedMetricRule>,
    groups: Vec<RuleGroup>,
}

struct ManagerShared {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn QueryEngine>,
    tables: Mutex<RuleTables>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

/// Schedules derived-metric rules and writes their results back.
pub struct DerivedMetricManager {
    shared: Arc<ManagerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DerivedMetricManager {
    /// Create a manager over the given storage and query engine.
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<dyn QueryEngine>) -> Self {
        DerivedMetricManager {
            shared: Arc::new(ManagerShared {
                storage,
                engine,
                tables: Mutex::new(RuleTables::default()),
                shutdown: Mutex::new(false),
                shutdown_cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register a standalone rule.
    pub fn add_rule(&self, rule: DerivedMetricRule) {
        info!(
            target: "tephra::derived",
            rule = %rule.name,
            expr = %rule.expr,
            "Added derived metric rule"
        );
        self.shared.tables.lock().rules.push(rule);
    }

    /// Register an empty rule group with a shared interval.
    pub fn add_group(&self, name: impl Into<String>, interval_ms: i64) {
        let name = name.into();
        info!(target: "tephra::derived", group = %name, interval_ms, "Added rule group");
        self.shared.tables.lock().groups.push(RuleGroup {
            name,
            interval_ms,
            rules: Vec::new(),
            last_execution_ms: 0,
        });
    }

    /// Attach a rule to a group. The group's interval overrides the
    /// rule's own. Returns whether the group was found.
    pub fn add_rule_to_group(&self, group_name: &str, mut rule: DerivedMetricRule) -> bool {
        let mut tables = self.shared.tables.lock();
        match tables.groups.iter_mut().find(|g| g.name == group_name) {
            Some(group) => {
                rule.interval_ms = group.interval_ms;
                group.rules.push(rule);
                true
            }
            None => {
                warn!(target: "tephra::derived", group = group_name, "Rule group not found");
                false
            }
        }
    }

    /// Remove every rule and group.
    pub fn clear_rules(&self) {
        let mut tables = self.shared.tables.lock();
        tables.rules.clear();
        tables.groups.clear();
    }

    /// Start the scheduler thread (idempotent).
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        *self.shared.shutdown.lock() = false;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tephra-derived-metrics".to_string())
            .spawn(move || scheduler_loop(shared));
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                info!(target: "tephra::derived", "Derived metric manager started");
            }
            Err(e) => {
                warn!(target: "tephra::derived", error = %e, "Failed to spawn scheduler thread")
            }
        }
    }

    /// Stop the scheduler thread and join it (idempotent).
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            *self.shared.shutdown.lock() = true;
            self.shared.shutdown_cv.notify_all();
            worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
            info!(target: "tephra::derived", "Derived metric manager stopped");
        }
    }

    /// Run one scheduling pass at the given time.
    ///
    /// The scheduler thread calls this every second; tests call it
    /// directly with a controlled clock.
    pub fn tick(&self, now_ms: Timestamp) {
        tick(&self.shared, now_ms);
    }

    /// Consecutive failure count for a rule, if it exists (groups
    /// included). Exposed for observability and tests.
    pub fn consecutive_failures(&self, rule_name: &str) -> Option<u32> {
        let tables = self.shared.tables.lock();
        tables
            .rules
            .iter()
            .chain(tables.groups.iter().flat_map(|g| g.rules.iter()))
            .find(|r| r.name == rule_name)
            .map(|r| r.consecutive_failures)
    }

    /// Number of registered standalone rules.
    pub fn rule_count(&self) -> usize {
        self.shared.tables.lock().rules.len()
    }
}

impl Drop for DerivedMetricManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn scheduler_loop(shared: Arc<ManagerShared>) {
    loop {
        {
            let mut stop = shared.shutdown.lock();
            if *stop {
                break;
            }
            let _ = shared.shutdown_cv.wait_for(&mut stop, TICK_INTERVAL);
            if *stop {
                break;
            }
        }
        tick(&shared, now_ms());
    }
}

fn tick(shared: &ManagerShared, now_ms: Timestamp) {
    let mut tables = shared.tables.lock();

    for rule in &mut tables.rules {
        if now_ms < rule.backoff_until_ms {
            continue;
        }
        if now_ms - rule.last_execution_ms >= rule.interval_ms {
            let result = execute_rule(shared, rule, now_ms);
            rule.last_execution_ms = now_ms;
            if let Err(e) = result {
                warn!(target: "tephra::derived", rule = %rule.name, error = %e, "Rule evaluation failed");
            }
        }
    }

    for group in &mut tables.groups {
        if now_ms - group.last_execution_ms >= group.interval_ms {
            debug!(target: "tephra::derived", group = %group.name, "Executing rule group");
            for rule in &mut group.rules {
                if now_ms < rule.backoff_until_ms {
                    continue;
                }
                let result = execute_rule(shared, rule, now_ms);
                rule.last_execution_ms = now_ms;
                if let Err(e) = result {
                    // One rule's failure never stops the rest of the group.
                    warn!(
                        target: "tephra::derived",
                        group = %group.name,
                        rule = %rule.name,
                        error = %e,
                        "Rule in group failed; continuing"
                    );
                }
            }
            group.last_execution_ms = now_ms;
        }
    }
}

fn execute_rule(
    shared: &ManagerShared,
    rule: &mut DerivedMetricRule,
    now_ms: Timestamp,
) -> Result<()> {
    let evaluated: Vec<(Labels, Vec<Sample>)> = match rule.evaluation {
        RuleEvaluation::Instant => {
            match shared.engine.execute_instant(&rule.expr, now_ms) {
                Ok(samples) => samples
                    .into_iter()
                    .map(|(labels, sample)| (labels, vec![sample]))
                    .collect(),
                Err(e) => {
                    let backoff = rule.record_failure(now_ms);
                    warn!(
                        target: "tephra::derived",
                        rule = %rule.name,
                        failures = rule.consecutive_failures,
                        backoff_secs = backoff,
                        "Instant evaluation failed; backing off"
                    );
                    return Err(e);
                }
            }
        }
        RuleEvaluation::Range { window_ms, step_ms } => {
            let step = if step_ms > 0 { step_ms } else { 60_000 };
            match shared
                .engine
                .execute_range(&rule.expr, now_ms - window_ms, now_ms, step)
            {
                Ok(series) => series,
                Err(e) => {
                    let backoff = rule.record_failure(now_ms);
                    warn!(
                        target: "tephra::derived",
                        rule = %rule.name,
                        failures = rule.consecutive_failures,
                        backoff_secs = backoff,
                        "Range evaluation failed; backing off"
                    );
                    return Err(e);
                }
            }
        }
    };

    rule.record_success();

    for (labels, samples) in evaluated {
        let output_labels = match rewrite_labels(&labels, rule) {
            Ok(labels) => labels,
            Err(e) => {
                warn!(target: "tephra::derived", rule = %rule.name, error = %e, "Skipping malformed result labels");
                continue;
            }
        };

        for sample in samples {
            if let Some(threshold) = rule.staleness_threshold_ms {
                if now_ms - sample.timestamp > threshold {
                    debug!(
                        target: "tephra::derived",
                        rule = %rule.name,
                        age_ms = now_ms - sample.timestamp,
                        "Skipping stale sample"
                    );
                    continue;
                }
            }

            let mut series = TimeSeries::new(output_labels.clone());
            if series.push_sample(sample).is_err() {
                continue;
            }
            if let Err(e) = shared.storage.write(&series) {
                warn!(
                    target: "tephra::derived",
                    rule = %rule.name,
                    error = %e,
                    "Failed to write derived metric"
                );
            }
        }
    }

    Ok(())
}

/// Copy result labels through the rule's keep/drop filter and stamp the
/// rule name into `__name__`. Keep wins over drop.
fn rewrite_labels(labels: &Labels, rule: &DerivedMetricRule) -> Result<Labels> {
    let mut out = Labels::new();
    for (name, value) in labels.iter() {
        if name == "__name__" {
            continue;
        }
        if !rule.keep_labels.is_empty() {
            if !rule.keep_labels.iter().any(|k| k == name) {
                continue;
            }
        } else if rule.drop_labels.iter().any(|d| d == name) {
            continue;
        }
        out.add(name, value)?;
    }
    out.add("__name__", rule.name.as_str())?;
    Ok(out)
}
