//! Multi-type working sets
//!
//! A [`Session`] holds facts of several types and one rule set (an engine) per fact type. Calling
//! [`Session::evaluate`] runs the rule sets in dependency order:
//!
//! ```text
//! plan ─→ for each stage (fact type F):
//!           snapshot all collections ─→ Rewriter ─→ RuleContext
//!           run F's engine over every F fact
//!           apply buffered inserts/retracts
//! ```
//!
//! Each stage reads a snapshot taken when it starts, so facts emitted by a stage are visible to
//! every later stage and never to the stage that emitted them. Collections are
//! `Arc<Vec<T>>`; a snapshot is a reference count bump and writers copy only while a snapshot
//! is alive.
//!
//! A stage's buffered changes are applied all together or not at all: they are staged on copies
//! of the affected collections, which replace the originals only once every change succeeded.

use crate::clock::{Clock, system_clock};
use crate::config::SessionConfig;
use crate::context::{ChangeKind, PendingChange, RuleContext};
use crate::dependency::{DependencyAnalyzer, ExecutionPlan, RuleSetDependencies};
use crate::engine::RulesEngine;
use crate::error::{ArbiterResult, FatalKind, RuleError};
use crate::result::{EvaluationResult, ExecutionOutcome, FactMatch, SessionError};
use crate::rewriter::{FactSnapshot, Rewriter};
use arbiter_types::{Fact, FactType};
use std::any::Any;
use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Type-erased collection of facts of one type
pub(crate) trait FactCollection: Send + Sync {
    fn len(&self) -> usize;

    /// Shared view of the current facts, an `Arc<Vec<T>>` behind `dyn Any`
    fn snapshot(&self) -> Arc<dyn Any + Send + Sync>;

    /// Apply a buffered change; `false` when a retract found nothing to remove
    fn apply(&mut self, change: PendingChange, limit: Option<usize>) -> ArbiterResult<bool>;

    fn clear(&mut self);

    /// Independent copy sharing the current facts until either side writes
    fn clone_box(&self) -> Box<dyn FactCollection>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct TypedCollection<T: Fact> {
    facts: Arc<Vec<T>>,
}

impl<T: Fact> TypedCollection<T> {
    pub(crate) fn boxed() -> Box<dyn FactCollection> {
        Box::new(Self { facts: Arc::new(Vec::new()) })
    }

    fn insert(&mut self, fact: T, limit: Option<usize>) -> ArbiterResult<()> {
        if let Some(max) = limit {
            if self.facts.len() >= max {
                return Err(RuleError::fatal(
                    FatalKind::ResourceExhausted,
                    format!("{} collection is full ({max} facts)", T::type_name()),
                ));
            }
        }
        Arc::make_mut(&mut self.facts).push(fact);
        Ok(())
    }

    fn retract(&mut self, fact: &T) -> bool {
        match self.facts.iter().position(|f| f == fact) {
            Some(index) => {
                Arc::make_mut(&mut self.facts).remove(index);
                true
            }
            None => false,
        }
    }
}

impl<T: Fact> FactCollection for TypedCollection<T> {
    fn len(&self) -> usize {
        self.facts.len()
    }

    fn snapshot(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.facts) as Arc<dyn Any + Send + Sync>
    }

    fn apply(&mut self, change: PendingChange, limit: Option<usize>) -> ArbiterResult<bool> {
        let fact = change.fact.downcast::<T>().map_err(|_| {
            RuleError::fatal(
                FatalKind::CorruptedInvariant,
                format!("buffered change for {} holds a different type", T::type_name()),
            )
        })?;
        match change.kind {
            ChangeKind::Insert => self.insert(*fact, limit).map(|()| true),
            ChangeKind::Retract => Ok(self.retract(&fact)),
        }
    }

    fn clear(&mut self) {
        self.facts = Arc::new(Vec::new());
    }

    fn clone_box(&self) -> Box<dyn FactCollection> {
        Box::new(Self { facts: Arc::clone(&self.facts) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Engine registered for one fact type, with the fact type erased
trait ErasedRuleSet: Send + Sync {
    fn dependencies(&self) -> RuleSetDependencies;

    fn rule_count(&self) -> usize;

    /// Run the engine over every fact of the stage snapshot
    fn run_stage(
        &self,
        rewriter: &Rewriter,
        ctx: &RuleContext<'_>,
        cancel: Option<&CancellationToken>,
        out: &mut EvaluationResult,
    ) -> ArbiterResult<ExecutionOutcome>;
}

struct RuleSet<F, E: ?Sized> {
    engine: Arc<E>,
    _fact: PhantomData<fn() -> F>,
}

impl<F, E> ErasedRuleSet for RuleSet<F, E>
where
    F: Fact,
    E: RulesEngine<F> + ?Sized + 'static,
{
    fn dependencies(&self) -> RuleSetDependencies {
        RuleSetDependencies {
            fact_type: FactType::of::<F>(),
            rules: self
                .engine
                .rules()
                .iter()
                .map(|rule| (rule.id().to_string(), rule.dependencies().clone()))
                .collect(),
        }
    }

    fn rule_count(&self) -> usize {
        self.engine.rule_count()
    }

    fn run_stage(
        &self,
        rewriter: &Rewriter,
        ctx: &RuleContext<'_>,
        cancel: Option<&CancellationToken>,
        out: &mut EvaluationResult,
    ) -> ArbiterResult<ExecutionOutcome> {
        let fact_type = FactType::of::<F>();
        let facts = rewriter.collection::<F>()?;
        let mut matches = Vec::new();
        let mut outcome = ExecutionOutcome::Completed;

        for (fact_index, fact) in facts.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                outcome = ExecutionOutcome::Cancelled;
                break;
            }

            let result = self.engine.execute_with(fact, ctx, cancel)?;
            out.facts_evaluated += 1;
            out.rules_evaluated += result.rules_evaluated;

            for rule_result in result.results {
                if rule_result.matched {
                    matches.push(FactMatch {
                        fact_index,
                        rule_id: rule_result.rule_id.clone(),
                        action_executed: rule_result.action_executed,
                    });
                }
                if let Some(error) = rule_result.error {
                    out.errors.push(SessionError { fact_type, fact_index, rule_id: rule_result.rule_id, error });
                }
            }

            if result.outcome == ExecutionOutcome::Cancelled {
                outcome = ExecutionOutcome::Cancelled;
                break;
            }
        }

        if !matches.is_empty() {
            out.matches.entry(fact_type).or_default().extend(matches);
        }
        Ok(outcome)
    }
}

/// Working set of typed facts plus one rule set per fact type
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    collections: BTreeMap<FactType, Box<dyn FactCollection>>,
    rule_sets: BTreeMap<FactType, Box<dyn ErasedRuleSet>>,
    clock: Arc<dyn Clock>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            config,
            collections: BTreeMap::new(),
            rule_sets: BTreeMap::new(),
            clock: system_clock(),
        };
        debug!(session_id = %session.id, "session created");
        session
    }

    /// Time evaluations and planning with `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Add `T` to the session schema; idempotent
    pub fn register_fact_type<T: Fact>(&mut self) -> &mut Self {
        self.collections.entry(FactType::of::<T>()).or_insert_with(TypedCollection::<T>::boxed);
        self
    }

    /// Registered fact types
    pub fn fact_types(&self) -> BTreeSet<FactType> {
        self.collections.keys().copied().collect()
    }

    /// Register `engine` as the rule set for facts of type `F`
    pub fn add_rule_set<F, E>(&mut self, engine: E) -> ArbiterResult<()>
    where
        F: Fact,
        E: RulesEngine<F> + 'static,
    {
        self.add_shared_rule_set::<F, E>(Arc::new(engine))
    }

    /// Register a shared engine as the rule set for facts of type `F`.
    ///
    /// Fails with a validation error if `F` already has a rule set, and with a dependency error
    /// if, under `strict_schema`, a rule references an unregistered fact type or if the new rule
    /// set closes a cycle between fact types.
    #[instrument(skip_all, fields(session_id = %self.id, fact_type = %FactType::of::<F>()))]
    pub fn add_shared_rule_set<F, E>(&mut self, engine: Arc<E>) -> ArbiterResult<()>
    where
        F: Fact,
        E: RulesEngine<F> + ?Sized + 'static,
    {
        let fact_type = FactType::of::<F>();
        if self.rule_sets.contains_key(&fact_type) {
            return Err(RuleError::validation(format!("a rule set for {fact_type} is already registered")));
        }

        let rule_set: Box<dyn ErasedRuleSet> = Box::new(RuleSet::<F, E> { engine, _fact: PhantomData });
        let dependencies = rule_set.dependencies();
        let mut known = self.fact_types();
        known.insert(fact_type);

        let mut analyzer = DependencyAnalyzer::with_clock(Arc::clone(&self.clock));
        if self.config.strict_schema {
            analyzer.validate_schema(&dependencies, &known)?;
        }
        let mut candidate = self.rule_set_dependencies();
        candidate.push(dependencies);
        analyzer.plan(&candidate, &known)?;

        info!(rules = rule_set.rule_count(), "rule set added");
        self.register_fact_type::<F>();
        self.rule_sets.insert(fact_type, rule_set);
        Ok(())
    }

    /// Whether `F` has a rule set
    pub fn has_rule_set<F: Fact>(&self) -> bool {
        self.rule_sets.contains_key(&FactType::of::<F>())
    }

    /// Add a fact; registers its type on first use.
    ///
    /// Exceeding `max_facts_per_type` is a fatal `ResourceExhausted` error.
    pub fn insert<T: Fact>(&mut self, fact: T) -> ArbiterResult<()> {
        let limit = self.config.max_facts_per_type;
        self.typed_mut::<T>()?.insert(fact, limit)
    }

    /// Add several facts of one type
    pub fn insert_all<T: Fact>(&mut self, facts: impl IntoIterator<Item = T>) -> ArbiterResult<()> {
        facts.into_iter().try_for_each(|fact| self.insert(fact))
    }

    /// Remove the first fact equal to `fact`; `false` if there was none
    pub fn retract<T: Fact>(&mut self, fact: &T) -> bool {
        match self.collections.get_mut(&FactType::of::<T>()) {
            Some(collection) => collection
                .as_any_mut()
                .downcast_mut::<TypedCollection<T>>()
                .is_some_and(|typed| typed.retract(fact)),
            None => false,
        }
    }

    /// Current facts of type `T`; empty when none were inserted
    pub fn facts<T: Fact>(&self) -> &[T] {
        self.collections
            .get(&FactType::of::<T>())
            .and_then(|c| c.as_any().downcast_ref::<TypedCollection<T>>())
            .map_or(&[], |typed| typed.facts.as_slice())
    }

    pub fn count<T: Fact>(&self) -> usize {
        self.facts::<T>().len()
    }

    pub fn total_facts(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    /// Remove every fact; rule sets and registered types stay
    pub fn clear(&mut self) {
        for collection in self.collections.values_mut() {
            collection.clear();
        }
        debug!(session_id = %self.id, "session facts cleared");
    }

    /// Stage order the next `evaluate` would use
    pub fn execution_plan(&self) -> ArbiterResult<ExecutionPlan> {
        DependencyAnalyzer::with_clock(Arc::clone(&self.clock))
            .plan(&self.rule_set_dependencies(), &self.fact_types())
    }

    /// Run every rule set over its facts, stage by stage
    pub fn evaluate(&mut self) -> ArbiterResult<EvaluationResult> {
        self.evaluate_with(None)
    }

    /// Like [`Session::evaluate`], stopping between rule evaluations once `token` is cancelled.
    ///
    /// Changes buffered before the cancellation are still applied.
    pub fn evaluate_cancellable(&mut self, token: &CancellationToken) -> ArbiterResult<EvaluationResult> {
        self.evaluate_with(Some(token))
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    fn evaluate_with(&mut self, cancel: Option<&CancellationToken>) -> ArbiterResult<EvaluationResult> {
        let start = self.clock.now();
        // Shared engines may have gained rules since registration
        let plan = self.execution_plan()?;
        let schema = self.config.strict_schema.then(|| self.fact_types());
        let mut result = EvaluationResult::default();

        for fact_type in plan.stages {
            let Some(rule_set) = self.rule_sets.get(&fact_type) else {
                continue;
            };

            let rewriter = Rewriter::from_snapshot(self.snapshot(), schema.clone());
            let outbox = RefCell::new(Vec::new());
            let outcome = {
                let ctx = RuleContext::bound(&rewriter, &outbox);
                rule_set.run_stage(&rewriter, &ctx, cancel, &mut result)?
            };
            result.stages.push(fact_type);
            result.rewrite_stats.absorb(rewriter.stats());
            drop(rewriter);

            let applied = self.apply_changes(outbox.into_inner())?;
            result.changes_applied += applied;
            debug!(stage = %fact_type, changes = applied, "stage complete");

            if outcome == ExecutionOutcome::Cancelled {
                warn!(stage = %fact_type, "session evaluation cancelled");
                result.outcome = ExecutionOutcome::Cancelled;
                break;
            }
        }

        result.duration = self.clock.elapsed_since(start);
        info!(
            stages = result.stages.len(),
            facts_evaluated = result.facts_evaluated,
            matches = result.total_matches(),
            errors = result.errors.len(),
            "session evaluated"
        );
        Ok(result)
    }

    fn snapshot(&self) -> FactSnapshot {
        self.collections.iter().map(|(fact_type, c)| (*fact_type, c.snapshot())).collect()
    }

    /// Apply a stage's changes; on error the session keeps its previous contents
    fn apply_changes(&mut self, changes: Vec<PendingChange>) -> ArbiterResult<usize> {
        let limit = self.config.max_facts_per_type;
        let mut staged: BTreeMap<FactType, Box<dyn FactCollection>> = BTreeMap::new();
        let mut applied = 0;
        for change in changes {
            let collection = match staged.entry(change.fact_type) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let copy = match self.collections.get(&change.fact_type) {
                        Some(current) => current.clone_box(),
                        None => (change.collection)(),
                    };
                    entry.insert(copy)
                }
            };
            if collection.apply(change, limit)? {
                applied += 1;
            }
        }
        self.collections.extend(staged);
        Ok(applied)
    }

    fn typed_mut<T: Fact>(&mut self) -> ArbiterResult<&mut TypedCollection<T>> {
        self.collections
            .entry(FactType::of::<T>())
            .or_insert_with(TypedCollection::<T>::boxed)
            .as_any_mut()
            .downcast_mut::<TypedCollection<T>>()
            .ok_or_else(|| {
                RuleError::fatal(
                    FatalKind::CorruptedInvariant,
                    format!("collection for {} holds a different type", T::type_name()),
                )
            })
    }

    fn rule_set_dependencies(&self) -> Vec<RuleSetDependencies> {
        self.rule_sets.values().map(|rs| rs.dependencies()).collect()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("fact_types", &self.fact_types())
            .field("rule_sets", &self.rule_sets.keys().collect::<Vec<_>>())
            .field("total_facts", &self.total_facts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::engine::{ImmutableEngine, LockedEngine};
    use crate::rule::Rule;

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: u32,
        customer: u32,
    }
    impl Fact for Order {}

    #[derive(Debug, Clone, PartialEq)]
    struct Customer {
        id: u32,
        blocked: bool,
    }
    impl Fact for Customer {}

    #[derive(Debug, Clone, PartialEq)]
    struct Alert {
        order: u32,
    }
    impl Fact for Alert {}

    fn blocked_customer_orders() -> ImmutableEngine<Order> {
        ImmutableEngine::new()
            .with_rule(
                Rule::builder("order-from-blocked-customer")
                    .condition(Condition::exists::<Customer>(|o: &Order, c: &Customer| {
                        c.id == o.customer && c.blocked
                    }))
                    .build()
                    .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn insert_retract_and_count() {
        let mut session = Session::new();
        session.insert(Order { id: 1, customer: 1 }).unwrap();
        session.insert(Order { id: 1, customer: 1 }).unwrap();
        assert_eq!(session.count::<Order>(), 2);

        assert!(session.retract(&Order { id: 1, customer: 1 }));
        assert_eq!(session.count::<Order>(), 1);
        assert!(!session.retract(&Order { id: 9, customer: 1 }));
        assert!(!session.retract(&Customer { id: 1, blocked: false }));
        assert_eq!(session.count::<Customer>(), 0);

        session.clear();
        assert_eq!(session.total_facts(), 0);
        assert!(session.fact_types().contains(&FactType::of::<Order>()));
    }

    #[test]
    fn fact_limit_is_fatal() {
        let mut session = Session::with_config(SessionConfig { max_facts_per_type: Some(1), ..SessionConfig::default() });
        session.insert(Order { id: 1, customer: 1 }).unwrap();
        let err = session.insert(Order { id: 2, customer: 1 }).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn strict_schema_requires_registered_dependencies() {
        let mut session = Session::new();
        let err = session.add_rule_set(blocked_customer_orders()).unwrap_err();
        assert!(matches!(err, RuleError::Dependency { ref fact_type, .. } if fact_type == "Customer"));
        assert!(session.fact_types().is_empty());

        session.register_fact_type::<Customer>();
        session.add_rule_set(blocked_customer_orders()).unwrap();
        assert!(session.has_rule_set::<Order>());
    }

    #[test]
    fn one_rule_set_per_fact_type() {
        let mut session = Session::new();
        session.register_fact_type::<Customer>();
        session.add_rule_set(blocked_customer_orders()).unwrap();
        let err = session.add_rule_set(blocked_customer_orders()).unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn joins_read_the_stage_snapshot() {
        let mut session = Session::new();
        session.register_fact_type::<Customer>();
        session.add_rule_set(blocked_customer_orders()).unwrap();
        session.insert(Customer { id: 7, blocked: true }).unwrap();
        session.insert(Order { id: 1, customer: 7 }).unwrap();
        session.insert(Order { id: 2, customer: 8 }).unwrap();

        let result = session.evaluate().unwrap();
        assert!(result.matched::<Order>(0, "order-from-blocked-customer"));
        assert!(!result.matched::<Order>(1, "order-from-blocked-customer"));
        assert_eq!(result.facts_evaluated, 2);
        assert!(result.rewrite_stats.rewrites >= 2);
    }

    #[test]
    fn emitted_facts_reach_later_stages() {
        let alerts = ImmutableEngine::new()
            .with_rule(
                Rule::builder("raise-alert")
                    .when(|o: &Order| o.customer == 7)
                    .then_with_context(|o, ctx| ctx.insert(Alert { order: o.id }))
                    .isolated()
                    .produces::<Alert>()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let audit = ImmutableEngine::new()
            .with_rule(Rule::builder("audit").when(|_: &Alert| true).build().unwrap())
            .unwrap();

        let mut session = Session::with_config(SessionConfig { strict_schema: false, ..SessionConfig::default() });
        session.add_rule_set(audit).unwrap();
        session.add_rule_set(alerts).unwrap();
        session.insert(Order { id: 3, customer: 7 }).unwrap();

        let plan = session.execution_plan().unwrap();
        assert!(plan.position(FactType::of::<Order>()) < plan.position(FactType::of::<Alert>()));

        let result = session.evaluate().unwrap();
        assert_eq!(result.changes_applied, 1);
        assert_eq!(session.facts::<Alert>(), &[Alert { order: 3 }]);
        assert!(result.matched::<Alert>(0, "audit"));
    }

    #[test]
    fn recoverable_errors_are_collected_per_fact() {
        let engine = LockedEngine::new();
        engine
            .register_rule(
                Rule::builder("undeclared-read")
                    .condition(Condition::when_with_context(|_: &Order, ctx| ctx.facts::<Customer>().any()))
                    .isolated()
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let mut session = Session::new();
        session.register_fact_type::<Customer>();
        session.add_rule_set(engine).unwrap();
        session.insert_all([Order { id: 1, customer: 1 }, Order { id: 2, customer: 1 }]).unwrap();

        let result = session.evaluate().unwrap();
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[1].fact_index, 1);
        assert_eq!(result.errors_for_rule("undeclared-read").count(), 2);
        assert!(matches!(result.errors[0].error, RuleError::Dependency { .. }));
    }

    #[test]
    fn failed_stage_changes_leave_the_session_untouched() {
        let alerts = ImmutableEngine::new()
            .with_rule(
                Rule::builder("double-alert")
                    .when(|_: &Order| true)
                    .then_with_context(|o, ctx| {
                        ctx.insert(Alert { order: o.id })?;
                        ctx.retract(Alert { order: 0 })?;
                        ctx.insert(Alert { order: o.id + 100 })
                    })
                    .isolated()
                    .produces::<Alert>()
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let config = SessionConfig { max_facts_per_type: Some(2), ..SessionConfig::default() };
        let mut session = Session::with_config(config);
        session.register_fact_type::<Alert>();
        session.add_rule_set(alerts).unwrap();
        session.insert(Alert { order: 0 }).unwrap();
        session.insert_all([Order { id: 1, customer: 1 }, Order { id: 2, customer: 1 }]).unwrap();

        // Order 2's first alert overflows the limit after three changes were staged
        let err = session.evaluate().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.facts::<Alert>(), &[Alert { order: 0 }]);
        assert_eq!(session.count::<Order>(), 2);
    }

    #[test]
    fn evaluation_is_timed_by_the_session_clock() {
        use crate::clock::ManualClock;

        let mut session = Session::new().with_clock(Arc::new(ManualClock::new()));
        session.register_fact_type::<Customer>();
        session.add_rule_set(blocked_customer_orders()).unwrap();
        session.insert(Order { id: 1, customer: 7 }).unwrap();
        assert_eq!(session.evaluate().unwrap().duration, std::time::Duration::ZERO);
    }

    #[test]
    fn cancelled_token_stops_before_the_first_fact() {
        let mut session = Session::new();
        session.register_fact_type::<Customer>();
        session.add_rule_set(blocked_customer_orders()).unwrap();
        session.insert(Order { id: 1, customer: 7 }).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = session.evaluate_cancellable(&token).unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
        assert_eq!(result.facts_evaluated, 0);
    }
}
