use super::{RulesEngine, admit, insertion_point, run_rules};
use crate::clock::{Clock, system_clock};
use crate::config::{EngineConfig, ReadConsistency};
use crate::context::RuleContext;
use crate::error::ArbiterResult;
use crate::metrics::{MetricsRegistry, PerformanceMetrics};
use crate::result::RulesEngineResult;
use crate::rule::{Rule, RuleId};
use arbiter_types::Fact;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
struct RuleTable<F: Fact> {
    sorted: Vec<Arc<Rule<F>>>,
    ids: HashSet<RuleId>,
}

/// Rules engine mutated in place behind a read-write lock.
///
/// With [`ReadConsistency::HoldForEvaluation`] an `execute` call holds the read lock for its whole
/// iteration, so a concurrent `register_rule` waits for it and never tears the rule list. With
/// [`ReadConsistency::Snapshot`] the sorted list is copied under the lock and evaluated after the
/// lock is released.
///
/// A poisoned lock is recovered rather than reported: every writer finishes its checks before it
/// touches the table, so a panicking writer leaves the table as it found it.
pub struct LockedEngine<F: Fact> {
    table: RwLock<RuleTable<F>>,
    config: EngineConfig,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
}

impl<F: Fact> LockedEngine<F> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            table: RwLock::new(RuleTable { sorted: Vec::new(), ids: HashSet::new() }),
            config,
            metrics: Arc::new(MetricsRegistry::new()),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record metrics into an existing registry
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, RuleTable<F>> {
        self.table.read().unwrap_or_else(|poisoned| {
            warn!("rule table lock poisoned by a panicking writer; recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, RuleTable<F>> {
        self.table.write().unwrap_or_else(|poisoned| {
            warn!("rule table lock poisoned by a panicking writer; recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Add a rule after existing rules of equal priority
    #[instrument(skip(self, rule), fields(rule_id = %rule.id()))]
    pub fn register_rule(&self, rule: Rule<F>) -> ArbiterResult<()> {
        let mut table = self.write();
        admit(&rule, |id| table.ids.contains(id), &self.config)?;

        let at = insertion_point(table.sorted.len(), |i| table.sorted[i].priority(), rule.priority());
        table.ids.insert(rule.id().to_string());
        table.sorted.insert(at, Arc::new(rule));
        debug!(position = at, rule_count = table.sorted.len(), "rule registered");
        Ok(())
    }

    /// Add several rules; stops at the first rejected one
    pub fn register_rules(&self, rules: impl IntoIterator<Item = Rule<F>>) -> ArbiterResult<()> {
        rules.into_iter().try_for_each(|rule| self.register_rule(rule))
    }

    /// Remove a rule; `false` when no such rule exists
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut table = self.write();
        if !table.ids.remove(id) {
            return false;
        }
        table.sorted.retain(|r| r.id() != id);
        debug!(rule_id = id, rule_count = table.sorted.len(), "rule removed");
        true
    }

    /// Remove every rule
    pub fn clear(&self) {
        let mut table = self.write();
        let removed = table.sorted.len();
        table.sorted.clear();
        table.ids.clear();
        info!(removed, "rule table cleared");
    }

    pub fn contains_rule(&self, id: &str) -> bool {
        self.read().ids.contains(id)
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}

impl<F: Fact> Default for LockedEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Fact> fmt::Debug for LockedEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<F: Fact> RulesEngine<F> for LockedEngine<F> {
    fn rules(&self) -> Vec<Arc<Rule<F>>> {
        self.read().sorted.clone()
    }

    fn rule_count(&self) -> usize {
        self.read().sorted.len()
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn execute_with(
        &self,
        fact: &F,
        ctx: &RuleContext<'_>,
        cancel: Option<&CancellationToken>,
    ) -> ArbiterResult<RulesEngineResult> {
        match self.config.read_consistency {
            ReadConsistency::HoldForEvaluation => {
                let table = self.read();
                run_rules(&table.sorted, fact, ctx, &self.config, &self.metrics, self.clock.as_ref(), cancel)
            }
            ReadConsistency::Snapshot => {
                let snapshot = self.read().sorted.clone();
                run_rules(&snapshot, fact, ctx, &self.config, &self.metrics, self.clock.as_ref(), cancel)
            }
        }
    }

    fn metrics(&self, rule_id: &str) -> Option<PerformanceMetrics> {
        self.metrics.get(rule_id)
    }

    fn all_metrics(&self) -> HashMap<RuleId, PerformanceMetrics> {
        self.metrics.all()
    }
}
