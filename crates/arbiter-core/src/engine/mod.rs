//! Rules engines
//!
//! Two variants share one scheduler and one [`RulesEngine`] interface:
//!
//! - [`ImmutableEngine`] is a persistent value. Adding or removing a rule returns a new engine
//!   that shares structure with the old one, so readers never block.
//! - [`LockedEngine`] is mutated in place behind a `RwLock`.
//!
//! Given the same rules and the same fact, both produce the same ordered results.

mod immutable;
mod locked;

pub use immutable::ImmutableEngine;
pub use locked::LockedEngine;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::RuleContext;
use crate::error::{ArbiterResult, RuleError};
use crate::metrics::{MetricsRegistry, PerformanceMetrics};
use crate::result::{ExecutionOutcome, RulesEngineResult};
use crate::rule::{Rule, RuleId};
use crate::validator::Validator;
use arbiter_types::Fact;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Common interface of both engine variants
pub trait RulesEngine<F: Fact>: Send + Sync {
    /// Rules in evaluation order
    fn rules(&self) -> Vec<Arc<Rule<F>>>;

    fn rule_count(&self) -> usize;

    fn config(&self) -> &EngineConfig;

    /// Evaluate every scheduled rule against `fact` using `ctx` for cross-fact queries
    fn execute_with(
        &self,
        fact: &F,
        ctx: &RuleContext<'_>,
        cancel: Option<&CancellationToken>,
    ) -> ArbiterResult<RulesEngineResult>;

    /// Evaluate against `fact` outside any session
    fn execute(&self, fact: &F) -> ArbiterResult<RulesEngineResult> {
        self.execute_with(fact, &RuleContext::detached(), None)
    }

    /// Evaluate with a caller-supplied context
    fn execute_with_context(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<RulesEngineResult> {
        self.execute_with(fact, ctx, None)
    }

    /// Evaluate until done or until `token` is cancelled
    fn execute_cancellable(&self, fact: &F, token: &CancellationToken) -> ArbiterResult<RulesEngineResult> {
        self.execute_with(fact, &RuleContext::detached(), Some(token))
    }

    /// Rules whose condition holds, without running actions.
    ///
    /// Rules whose condition fails with a non-fatal error are left out.
    fn matching_rules(&self, fact: &F) -> ArbiterResult<Vec<Arc<Rule<F>>>> {
        self.matching_rules_with(fact, &RuleContext::detached())
    }

    fn matching_rules_with(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<Vec<Arc<Rule<F>>>> {
        let mut matching = Vec::new();
        for rule in self.rules() {
            match rule.evaluate(fact, ctx) {
                Ok(true) => matching.push(rule),
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(rule_id = %rule.id(), error = %err, "rule skipped in preview"),
            }
        }
        Ok(matching)
    }

    fn metrics(&self, rule_id: &str) -> Option<PerformanceMetrics>;

    fn all_metrics(&self) -> HashMap<RuleId, PerformanceMetrics>;
}

/// Index at which a rule of `priority` keeps the list sorted and lands after its equals
pub(crate) fn insertion_point(
    len: usize,
    priority_at: impl Fn(usize) -> i32,
    priority: i32,
) -> usize {
    // First index whose priority is strictly lower
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if priority_at(mid) >= priority {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Admission checks shared by both engines
pub(crate) fn admit<F: Fact>(
    rule: &Rule<F>,
    contains: impl Fn(&str) -> bool,
    config: &EngineConfig,
) -> ArbiterResult<()> {
    if contains(rule.id()) {
        return Err(RuleError::validation(format!("duplicate rule id '{}'", rule.id())).with_rule(rule.id()));
    }
    if config.validate_on_register {
        let report = Validator::new().validate_rule(rule);
        if !report.is_valid() {
            return Err(RuleError::validation(report.error_summary()).with_rule(rule.id()));
        }
        for warning in &report.warnings {
            warn!(rule_id = %rule.id(), warning = %warning.message, "rule admitted with warning");
        }
    }
    Ok(())
}

/// Evaluate `rules` in order against `fact`.
///
/// Both engine variants delegate here, which keeps their results identical.
pub(crate) fn run_rules<'r, F: Fact + 'r>(
    rules: impl IntoIterator<Item = &'r Arc<Rule<F>>>,
    fact: &F,
    ctx: &RuleContext<'_>,
    config: &EngineConfig,
    metrics: &MetricsRegistry,
    clock: &dyn Clock,
    cancel: Option<&CancellationToken>,
) -> ArbiterResult<RulesEngineResult> {
    let start = clock.now();
    let mut result = RulesEngineResult::default();

    for rule in rules {
        if config.max_rules_to_execute.is_some_and(|max| result.rules_evaluated >= max) {
            result.outcome = ExecutionOutcome::Stopped;
            break;
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(rules_evaluated = result.rules_evaluated, "evaluation cancelled");
            result.outcome = ExecutionOutcome::Cancelled;
            break;
        }

        let rule_result = rule.execute(fact, ctx, clock)?;
        if config.track_performance {
            metrics.record(rule.id(), rule_result.duration, clock.wall_time());
        }
        if let Some(err) = &rule_result.error {
            debug!(rule_id = %rule.id(), error = %err, "rule recorded an error");
        }

        let matched = rule_result.matched;
        result.push(rule_result, rule.tags());
        if matched && config.stop_on_first_match {
            result.outcome = ExecutionOutcome::Stopped;
            break;
        }
    }

    result.total_duration = clock.elapsed_since(start);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_point_lands_after_equal_priorities() {
        let priorities = [10, 5, 5, 0];
        let at = |i: usize| priorities[i];
        assert_eq!(insertion_point(4, at, 20), 0);
        assert_eq!(insertion_point(4, at, 5), 3);
        assert_eq!(insertion_point(4, at, 0), 4);
        assert_eq!(insertion_point(4, at, -1), 4);
        assert_eq!(insertion_point(0, at, 1), 0);
    }
}
