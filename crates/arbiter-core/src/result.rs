//! Results of rule, engine and session evaluation

use crate::error::RuleError;
use crate::rewriter::RewriteStats;
use crate::rule::{Rule, RuleId};
use arbiter_types::{Fact, FactType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Outcome of evaluating one rule against one fact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub priority: i32,
    /// The condition held
    pub matched: bool,
    /// The condition held and every action succeeded
    pub action_executed: bool,
    /// Actions that completed before the first failure
    pub actions_run: usize,
    /// Non-fatal error raised by the condition or an action
    pub error: Option<RuleError>,
    pub duration: Duration,
}

impl RuleResult {
    pub(crate) fn pending<F: Fact>(rule: &Rule<F>) -> Self {
        Self {
            rule_id: rule.id().to_string(),
            rule_name: rule.name().to_string(),
            priority: rule.priority(),
            matched: false,
            action_executed: false,
            actions_run: 0,
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Same outcome, ignoring timing
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.rule_id == other.rule_id
            && self.matched == other.matched
            && self.action_executed == other.action_executed
            && self.actions_run == other.actions_run
            && self.error == other.error
    }
}

/// How an evaluation call ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    /// Every scheduled rule was considered
    #[default]
    Completed,
    /// `stop_on_first_match` or `max_rules_to_execute` ended the run early
    Stopped,
    /// The cancellation token fired; results cover the work done before it
    Cancelled,
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RulesEngineResult {
    /// One entry per evaluated rule, in evaluation order
    pub results: Vec<RuleResult>,
    pub rules_evaluated: usize,
    pub rules_matched: usize,
    /// Matched rules whose actions all succeeded
    pub rules_executed: usize,
    /// Rules that recorded a non-fatal error
    pub errors: usize,
    pub total_duration: Duration,
    pub outcome: ExecutionOutcome,
    /// Union of the tags of all matched rules
    pub matched_tags: BTreeSet<String>,
}

impl RulesEngineResult {
    pub(crate) fn push(&mut self, result: RuleResult, tags: &BTreeSet<String>) {
        self.rules_evaluated += 1;
        if result.matched {
            self.rules_matched += 1;
            self.matched_tags.extend(tags.iter().cloned());
        }
        if result.action_executed {
            self.rules_executed += 1;
        }
        if result.error.is_some() {
            self.errors += 1;
        }
        self.results.push(result);
    }

    /// Ids of matched rules in evaluation order
    pub fn matched_rule_ids(&self) -> Vec<&str> {
        self.results.iter().filter(|r| r.matched).map(|r| r.rule_id.as_str()).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn result_for(&self, rule_id: &str) -> Option<&RuleResult> {
        self.results.iter().find(|r| r.rule_id == rule_id)
    }

    /// Same outcomes in the same order, ignoring timing
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.outcome == other.outcome
            && self.matched_tags == other.matched_tags
            && self.results.len() == other.results.len()
            && self.results.iter().zip(&other.results).all(|(a, b)| a.same_outcome(b))
    }
}

/// A rule that matched one fact during a session evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactMatch {
    /// Position of the fact in its collection's stage snapshot
    pub fact_index: usize,
    pub rule_id: RuleId,
    pub action_executed: bool,
}

/// A non-fatal error recorded during a session evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionError {
    pub fact_type: FactType,
    pub fact_index: usize,
    pub rule_id: RuleId,
    pub error: RuleError,
}

/// Outcome of one `Session::evaluate` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationResult {
    /// Fact types in the order their stages ran
    pub stages: Vec<FactType>,
    /// Matches per fact type
    pub matches: BTreeMap<FactType, Vec<FactMatch>>,
    pub errors: Vec<SessionError>,
    pub facts_evaluated: usize,
    pub rules_evaluated: usize,
    /// Facts inserted or retracted by actions
    pub changes_applied: usize,
    pub rewrite_stats: RewriteStats,
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
}

impl EvaluationResult {
    /// Matches recorded for facts of type `T`
    pub fn matches_for<T: Fact>(&self) -> &[FactMatch] {
        self.matches.get(&FactType::of::<T>()).map_or(&[], Vec::as_slice)
    }

    /// Distinct rule ids that matched some fact of type `T`
    pub fn matched_rule_ids<T: Fact>(&self) -> BTreeSet<&str> {
        self.matches_for::<T>().iter().map(|m| m.rule_id.as_str()).collect()
    }

    /// Whether rule `rule_id` matched the fact at `fact_index` of type `T`
    pub fn matched<T: Fact>(&self, fact_index: usize, rule_id: &str) -> bool {
        self.matches_for::<T>().iter().any(|m| m.fact_index == fact_index && m.rule_id == rule_id)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors_for_rule(&self, rule_id: &str) -> impl Iterator<Item = &SessionError> {
        self.errors.iter().filter(move |e| e.rule_id == rule_id)
    }

    pub fn total_matches(&self) -> usize {
        self.matches.values().map(Vec::len).sum()
    }
}
