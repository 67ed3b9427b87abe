use super::{RulesEngine, admit, insertion_point, run_rules};
use crate::clock::{Clock, system_clock};
use crate::config::EngineConfig;
use crate::context::RuleContext;
use crate::error::ArbiterResult;
use crate::metrics::{MetricsRegistry, PerformanceMetrics};
use crate::result::RulesEngineResult;
use crate::rule::{Rule, RuleId};
use arbiter_types::Fact;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Persistent rules engine.
///
/// Every modification returns a new engine; the old one is untouched and can keep serving
/// concurrent readers. Rules live in an `im::Vector` kept in scheduling order, so adding a rule
/// costs a binary search plus a structural-sharing insert rather than a full copy and re-sort.
/// Clones share the metrics registry.
pub struct ImmutableEngine<F: Fact> {
    rules: im::Vector<Arc<Rule<F>>>,
    ids: im::HashSet<RuleId>,
    config: Arc<EngineConfig>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    version: u64,
}

impl<F: Fact> ImmutableEngine<F> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            rules: im::Vector::new(),
            ids: im::HashSet::new(),
            config: Arc::new(config),
            metrics: Arc::new(MetricsRegistry::new()),
            clock: system_clock(),
            version: 0,
        }
    }

    /// Same rules, timed by `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine with `rule` added after existing rules of equal priority
    #[instrument(skip(self, rule), fields(rule_id = %rule.id()))]
    pub fn with_rule(&self, rule: Rule<F>) -> ArbiterResult<Self> {
        admit(&rule, |id| self.ids.contains(id), &self.config)?;

        let at = insertion_point(
            self.rules.len(),
            |i| self.rules.get(i).map_or(i32::MIN, |r| r.priority()),
            rule.priority(),
        );
        let mut next = self.clone();
        next.ids.insert(rule.id().to_string());
        next.rules.insert(at, Arc::new(rule));
        next.version += 1;
        debug!(position = at, rule_count = next.rules.len(), "rule added");
        Ok(next)
    }

    /// Engine with every rule of `rules` added in order
    pub fn with_rules(&self, rules: impl IntoIterator<Item = Rule<F>>) -> ArbiterResult<Self> {
        rules.into_iter().try_fold(self.clone(), |engine, rule| engine.with_rule(rule))
    }

    /// Engine without the rule `id`; `None` when no such rule exists
    pub fn without_rule(&self, id: &str) -> Option<Self> {
        let index = self.rules.iter().position(|r| r.id() == id)?;
        let mut next = self.clone();
        next.rules.remove(index);
        next.ids.remove(id);
        next.version += 1;
        debug!(rule_id = id, rule_count = next.rules.len(), "rule removed");
        Some(next)
    }

    /// Engine with no rules, sharing configuration and metrics
    #[must_use]
    pub fn cleared(&self) -> Self {
        let mut next = self.clone();
        next.rules = im::Vector::new();
        next.ids = im::HashSet::new();
        next.version += 1;
        next
    }

    pub fn contains_rule(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn rule(&self, id: &str) -> Option<Arc<Rule<F>>> {
        self.rules.iter().find(|r| r.id() == id).cloned()
    }

    /// Number of modifications since the engine was created
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }
}

impl<F: Fact> Clone for ImmutableEngine<F> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            ids: self.ids.clone(),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            clock: Arc::clone(&self.clock),
            version: self.version,
        }
    }
}

impl<F: Fact> Default for ImmutableEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Fact> fmt::Debug for ImmutableEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableEngine")
            .field("rules", &self.rules.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("version", &self.version)
            .finish()
    }
}

impl<F: Fact> RulesEngine<F> for ImmutableEngine<F> {
    fn rules(&self) -> Vec<Arc<Rule<F>>> {
        self.rules.iter().cloned().collect()
    }

    fn rule_count(&self) -> usize {
        self.rules.len()
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
        run_rules(self.rules.iter(), fact, ctx, &self.config, &self.metrics, self.clock.as_ref(), cancel)
    }

    fn metrics(&self, rule_id: &str) -> Option<PerformanceMetrics> {
        self.metrics.get(rule_id)
    }

    fn all_metrics(&self) -> HashMap<RuleId, PerformanceMetrics> {
        self.metrics.all()
    }
}
