//! Per-rule execution metrics
//!
//! Both engine variants record into a shared [`MetricsRegistry`]. Each rule gets a cell of atomic
//! counters stored in a `DashMap`, so concurrent `execute` calls update metrics without a global
//! lock and without losing updates.

use crate::rule::RuleId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of one rule's execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceMetrics {
    /// Times the rule was evaluated
    pub execution_count: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Wall-clock time of the most recent evaluation
    pub last_executed: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct MetricsCell {
    count: AtomicU64,
    total_nanos: AtomicU64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
    last_millis: AtomicI64,
}

impl MetricsCell {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            min_nanos: AtomicU64::new(u64::MAX),
            max_nanos: AtomicU64::new(0),
            last_millis: AtomicI64::new(i64::MIN),
        }
    }

    fn record(&self, duration: Duration, at: DateTime<Utc>) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.min_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.last_millis.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
    }

    fn snapshot(&self) -> PerformanceMetrics {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return PerformanceMetrics::default();
        }
        let total = self.total_nanos.load(Ordering::Relaxed);
        PerformanceMetrics {
            execution_count: count,
            total_duration: Duration::from_nanos(total),
            average_duration: Duration::from_nanos(total / count),
            min_duration: Duration::from_nanos(self.min_nanos.load(Ordering::Relaxed)),
            max_duration: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
            last_executed: DateTime::from_timestamp_millis(self.last_millis.load(Ordering::Relaxed)),
        }
    }
}

/// Thread-safe map from rule id to execution statistics
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    rules: DashMap<RuleId, MetricsCell>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one evaluation of `rule_id` that finished at `at`
    pub fn record(&self, rule_id: &str, duration: Duration, at: DateTime<Utc>) {
        if let Some(cell) = self.rules.get(rule_id) {
            cell.record(duration, at);
            return;
        }
        self.rules.entry(rule_id.to_string()).or_insert_with(MetricsCell::new).record(duration, at);
    }

    /// Statistics for one rule; `None` if it never ran
    pub fn get(&self, rule_id: &str) -> Option<PerformanceMetrics> {
        self.rules.get(rule_id).map(|cell| cell.snapshot())
    }

    /// Statistics for every rule that ran
    pub fn all(&self) -> HashMap<RuleId, PerformanceMetrics> {
        self.rules.iter().map(|entry| (entry.key().clone(), entry.value().snapshot())).collect()
    }

    /// Forget one rule's statistics
    pub fn remove(&self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    pub fn clear(&self) {
        self.rules.clear();
    }

    /// Number of rules with statistics
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
