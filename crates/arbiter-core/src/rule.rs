//! Rules and their builders

use crate::clock::Clock;
use crate::condition::Condition;
use crate::context::{RuleContext, RuleScope};
use crate::dependency::RuleDependencies;
use crate::error::{ArbiterResult, RuleError};
use crate::expression::Expression;
use crate::result::RuleResult;
use crate::trace::Trace;
use arbiter_types::{Fact, FactType};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Unique identifier of a rule within an engine
pub type RuleId = String;

/// Side effect run when a rule matches
pub type ActionFn<F> = Arc<dyn Fn(&F, &RuleContext<'_>) -> ArbiterResult<()> + Send + Sync>;

/// Named action of a rule
pub struct Action<F: Fact> {
    name: String,
    run: ActionFn<F>,
    contextual: bool,
}

impl<F: Fact> Action<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the action receives the evaluation context
    pub fn is_contextual(&self) -> bool {
        self.contextual
    }

    pub fn run(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<()> {
        (self.run)(fact, ctx)
    }
}

impl<F: Fact> Clone for Action<F> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), run: Arc::clone(&self.run), contextual: self.contextual }
    }
}

impl<F: Fact> fmt::Debug for Action<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}

/// A condition over facts of type `F` plus the actions to run when it holds
pub struct Rule<F: Fact> {
    id: RuleId,
    name: String,
    description: Option<String>,
    priority: i32,
    tags: BTreeSet<String>,
    condition: Condition<F>,
    actions: Vec<Action<F>>,
    dependencies: RuleDependencies,
}

impl<F: Fact> Rule<F> {
    /// Start building a rule
    pub fn builder(id: impl Into<RuleId>) -> RuleBuilder<F> {
        RuleBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Higher runs first
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn condition(&self) -> &Condition<F> {
        &self.condition
    }

    pub fn actions(&self) -> &[Action<F>] {
        &self.actions
    }

    pub fn dependencies(&self) -> &RuleDependencies {
        &self.dependencies
    }

    /// Fact type the rule evaluates
    pub fn fact_type(&self) -> FactType {
        FactType::of::<F>()
    }

    pub(crate) fn scope(&self) -> RuleScope<'_> {
        RuleScope { rule_id: &self.id, fact_type: self.fact_type(), dependencies: &self.dependencies }
    }

    /// Evaluate the condition only
    pub fn evaluate(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<bool> {
        let ctx = ctx.scoped(self.scope());
        self.condition.evaluate(fact, &ctx).map_err(|e| e.with_rule(&self.id))
    }

    /// Evaluate the condition and record every visited node
    pub fn evaluate_with_trace(&self, fact: &F, ctx: &RuleContext<'_>) -> (ArbiterResult<bool>, Trace) {
        let ctx = ctx.scoped(self.scope());
        let (outcome, trace) = self.condition.evaluate_with_trace(fact, &ctx);
        (outcome.map_err(|e| e.with_rule(&self.id)), trace)
    }

    /// Evaluate the condition and, when it holds, run the actions in order.
    ///
    /// Non-fatal errors end up on the returned [`RuleResult`]; the first failing action stops the
    /// remaining ones. Fatal errors are returned as `Err`.
    pub fn execute(&self, fact: &F, ctx: &RuleContext<'_>, clock: &dyn Clock) -> ArbiterResult<RuleResult> {
        let start = clock.now();
        let mut result = RuleResult::pending(self);
        let ctx = ctx.scoped(self.scope());

        match self.condition.evaluate(fact, &ctx) {
            Ok(true) => {
                result.matched = true;
                for action in &self.actions {
                    match action.run(fact, &ctx) {
                        Ok(()) => result.actions_run += 1,
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            trace!(rule_id = %self.id, action = %action.name, error = %err, "action failed");
                            result.error = Some(err.with_rule(&self.id));
                            break;
                        }
                    }
                }
                result.action_executed = result.error.is_none();
            }
            Ok(false) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => result.error = Some(err.with_rule(&self.id)),
        }

        result.duration = clock.elapsed_since(start);
        Ok(result)
    }
}

impl<F: Fact> Clone for Rule<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
            condition: self.condition.clone(),
            actions: self.actions.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

impl<F: Fact> fmt::Debug for Rule<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .field("condition", &self.condition)
            .field("actions", &self.actions)
            .finish()
    }
}

/// Fluent builder for [`Rule`]
pub struct RuleBuilder<F: Fact> {
    id: RuleId,
    name: Option<String>,
    description: Option<String>,
    priority: i32,
    tags: BTreeSet<String>,
    condition: Option<Condition<F>>,
    actions: Vec<Action<F>>,
    dependencies: RuleDependencies,
}

impl<F: Fact> RuleBuilder<F> {
    pub fn new(id: impl Into<RuleId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            priority: 0,
            tags: BTreeSet::new(),
            condition: None,
            actions: Vec::new(),
            dependencies: RuleDependencies::default(),
        }
    }

    /// Display name; defaults to the id
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the condition, replacing any previous one
    #[must_use]
    pub fn condition(mut self, condition: Condition<F>) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Condition from an infallible closure
    #[must_use]
    pub fn when(self, predicate: impl Fn(&F) -> bool + Send + Sync + 'static) -> Self {
        self.condition(Condition::when(predicate))
    }

    /// Condition from a closure that also receives the evaluation context
    #[must_use]
    pub fn when_with_context(
        self,
        predicate: impl Fn(&F, &RuleContext<'_>) -> ArbiterResult<bool> + Send + Sync + 'static,
    ) -> Self {
        self.condition(Condition::when_with_context(predicate))
    }

    /// Condition from an inspectable expression
    #[must_use]
    pub fn expression(self, expression: Expression) -> Self {
        self.condition(Condition::Expression(expression))
    }

    /// Action that only needs the fact
    #[must_use]
    pub fn then(self, action: impl Fn(&F) -> ArbiterResult<()> + Send + Sync + 'static) -> Self {
        let name = format!("action-{}", self.actions.len() + 1);
        self.then_named(name, action)
    }

    #[must_use]
    pub fn then_named(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&F) -> ArbiterResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.actions.push(Action {
            name: name.into(),
            run: Arc::new(move |fact: &F, _: &RuleContext<'_>| action(fact)),
            contextual: false,
        });
        self
    }

    /// Action that may query or emit facts through the context
    #[must_use]
    pub fn then_with_context(
        mut self,
        action: impl Fn(&F, &RuleContext<'_>) -> ArbiterResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.actions.push(Action {
            name: format!("action-{}", self.actions.len() + 1),
            run: Arc::new(action),
            contextual: true,
        });
        self
    }

    /// Declare that the rule reads facts of type `T`
    #[must_use]
    pub fn depends_on<T: Fact>(mut self) -> Self {
        self.dependencies = self.dependencies.declare(FactType::of::<T>());
        self
    }

    /// Declare that the rule reads no other fact type
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.dependencies = self.dependencies.isolated();
        self
    }

    /// Declare that the rule's actions emit facts of type `T`
    #[must_use]
    pub fn produces<T: Fact>(mut self) -> Self {
        self.dependencies = self.dependencies.produce(FactType::of::<T>());
        self
    }

    pub fn build(self) -> ArbiterResult<Rule<F>> {
        self.build_with(RuleDependencies::default())
    }

    /// Build with extra dependencies found in parts that are not visible from the condition
    fn build_with(self, inherited: RuleDependencies) -> ArbiterResult<Rule<F>> {
        if self.id.trim().is_empty() {
            return Err(RuleError::validation("rule id must not be empty"));
        }
        let Some(condition) = self.condition else {
            return Err(RuleError::validation("rule has no condition").with_rule(&self.id));
        };

        let mut dependencies = self.dependencies.cover(&inherited.merge(&condition.dependencies()));
        if self.actions.iter().any(Action::is_contextual) {
            dependencies = dependencies.opaque();
        }

        Ok(Rule {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            description: self.description,
            priority: self.priority,
            tags: self.tags,
            condition,
            actions: self.actions,
            dependencies,
        })
    }
}

/// Boolean operator of a composite rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOperator {
    All,
    Any,
    Not,
}

/// Builder for a rule whose condition combines the conditions of child rules.
///
/// The children's actions are not run; the composite has its own. Its dependency set is the union
/// of the children's, and a child that reads undeclared types keeps the whole composite
/// conservative unless the composite itself declares its dependencies.
pub struct CompositeRule<F: Fact> {
    operator: CompositeOperator,
    children: Vec<Rule<F>>,
    builder: RuleBuilder<F>,
}

impl<F: Fact> CompositeRule<F> {
    pub fn new(id: impl Into<RuleId>, operator: CompositeOperator) -> Self {
        Self { operator, children: Vec::new(), builder: RuleBuilder::new(id) }
    }

    /// Matches when every child matches; no children always matches
    pub fn all(id: impl Into<RuleId>) -> Self {
        Self::new(id, CompositeOperator::All)
    }

    /// Matches when some child matches; no children never matches
    pub fn any(id: impl Into<RuleId>) -> Self {
        Self::new(id, CompositeOperator::Any)
    }

    /// Matches when its single child does not
    pub fn not(id: impl Into<RuleId>) -> Self {
        Self::new(id, CompositeOperator::Not)
    }

    #[must_use]
    pub fn child(mut self, rule: Rule<F>) -> Self {
        self.children.push(rule);
        self
    }

    /// Adjust the underlying rule builder (name, priority, tags, actions, dependencies)
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(RuleBuilder<F>) -> RuleBuilder<F>) -> Self {
        self.builder = f(self.builder);
        self
    }

    pub fn build(self) -> ArbiterResult<Rule<F>> {
        let id = self.builder.id.clone();
        if self.operator == CompositeOperator::Not && self.children.len() != 1 {
            return Err(RuleError::validation(format!(
                "NOT composite needs exactly one child, got {}",
                self.children.len()
            ))
            .with_rule(&id));
        }

        let dependencies = self
            .children
            .iter()
            .fold(RuleDependencies::default(), |acc, child| acc.merge(&child.dependencies));
        let conditions: Vec<Condition<F>> =
            self.children.into_iter().map(|child| child.condition).collect();

        let condition = match self.operator {
            CompositeOperator::All => Condition::All(conditions),
            CompositeOperator::Any => Condition::Any(conditions),
            CompositeOperator::Not => {
                Condition::not(conditions.into_iter().next().unwrap_or_else(Condition::never))
            }
        };

        self.builder.condition(condition).build_with(dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Account {
        balance: i64,
        premium: bool,
    }
    impl Fact for Account {}

    #[derive(Debug, Clone, PartialEq)]
    struct Territory;
    impl Fact for Territory {}

    fn rich() -> Account {
        Account { balance: 15_000, premium: false }
    }

    #[test]
    fn build_requires_condition_and_id() {
        let err = Rule::<Account>::builder("r").build().unwrap_err();
        assert_eq!(err.category(), "validation");
        assert_eq!(err.rule_id(), Some("r"));

        assert!(Rule::<Account>::builder(" ").when(|_| true).build().is_err());
    }

    #[test]
    fn builder_defaults() {
        let rule = Rule::<Account>::builder("high-balance").when(|a| a.balance > 10_000).build().unwrap();
        assert_eq!(rule.name(), "high-balance");
        assert_eq!(rule.priority(), 0);
        assert!(rule.tags().is_empty());
        assert!(rule.dependencies().access() == crate::dependency::DependencyAccess::Only(BTreeSet::new()));
    }

    #[test]
    fn execute_runs_actions_in_order_when_matched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (first, second) = (Arc::clone(&hits), Arc::clone(&hits));
        let rule = Rule::<Account>::builder("high-balance")
            .when(|a| a.balance > 10_000)
            .then(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .then(move |_| {
                second.fetch_add(10, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();

        let result = rule.execute(&rich(), &RuleContext::detached(), &SystemClock).unwrap();
        assert!(result.matched);
        assert!(result.action_executed);
        assert_eq!(result.actions_run, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        let result = rule
            .execute(&Account { balance: 1, premium: false }, &RuleContext::detached(), &SystemClock)
            .unwrap();
        assert!(!result.matched);
        assert!(!result.action_executed);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn first_failing_action_stops_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let rule = Rule::<Account>::builder("r")
            .when(|_| true)
            .then(|_| Err(RuleError::evaluation("ledger unavailable")))
            .then(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();

        let result = rule.execute(&rich(), &RuleContext::detached(), &SystemClock).unwrap();
        assert!(result.matched);
        assert!(!result.action_executed);
        assert_eq!(result.error.as_ref().and_then(RuleError::rule_id), Some("r"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fatal_errors_escape_execute() {
        let rule = Rule::<Account>::builder("r")
            .condition(Condition::try_when(|_| {
                Err(RuleError::fatal(crate::error::FatalKind::ResourceExhausted, "out of memory"))
            }))
            .build()
            .unwrap();
        let err = rule.execute(&rich(), &RuleContext::detached(), &SystemClock).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn duration_comes_from_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let ticking = Arc::clone(&clock);
        let rule = Rule::<Account>::builder("slow")
            .when(move |_| {
                ticking.advance(std::time::Duration::from_millis(3));
                true
            })
            .build()
            .unwrap();
        let result = rule.execute(&rich(), &RuleContext::detached(), clock.as_ref()).unwrap();
        assert_eq!(result.duration, std::time::Duration::from_millis(3));
    }

    #[test]
    fn contextual_actions_make_a_rule_opaque() {
        let rule = Rule::<Account>::builder("emit")
            .when(|_| true)
            .then_with_context(|_, ctx| ctx.insert(Territory))
            .build()
            .unwrap();
        assert!(rule.dependencies().is_opaque());

        let narrowed = Rule::<Account>::builder("emit")
            .when(|_| true)
            .then_with_context(|_, ctx| ctx.insert(Territory))
            .isolated()
            .produces::<Territory>()
            .build()
            .unwrap();
        assert_eq!(narrowed.dependencies().access(), crate::dependency::DependencyAccess::Only(BTreeSet::new()));
        assert!(narrowed.dependencies().produces(FactType::of::<Territory>()));
    }

    #[test]
    fn composite_rules_combine_children() {
        let high = Rule::<Account>::builder("high").when(|a| a.balance > 10_000).build().unwrap();
        let premium = Rule::<Account>::builder("premium")
            .condition(Condition::when(|a: &Account| a.premium).and(Condition::exists::<Territory>(|_, _| true)))
            .build()
            .unwrap();

        let any = CompositeRule::any("high-or-premium")
            .child(high.clone())
            .child(premium.clone())
            .configure(|b| b.priority(5))
            .build()
            .unwrap();
        assert_eq!(any.priority(), 5);
        assert!(any.evaluate(&rich(), &RuleContext::detached()).unwrap());
        assert!(any.dependencies().detected().contains(&FactType::of::<Territory>()));

        let none = CompositeRule::<Account>::all("empty").build().unwrap();
        assert!(none.evaluate(&rich(), &RuleContext::detached()).unwrap());

        let not = CompositeRule::not("not-high").child(high.clone()).build().unwrap();
        assert!(!not.evaluate(&rich(), &RuleContext::detached()).unwrap());

        let err = CompositeRule::not("bad").child(high).child(premium).build().unwrap_err();
        assert!(err.to_string().contains("exactly one child"));
    }

    #[test]
    fn isolated_child_does_not_narrow_an_undeclared_sibling() {
        use crate::dependency::DependencyAccess;

        let isolated = Rule::<Account>::builder("isolated").when(|a| a.premium).isolated().build().unwrap();
        let reader = Rule::<Account>::builder("reader")
            .when_with_context(|_, ctx| ctx.facts::<Territory>().exists())
            .build()
            .unwrap();
        assert_eq!(reader.dependencies().access(), DependencyAccess::Wildcard);

        let both = CompositeRule::all("both").child(isolated.clone()).child(reader.clone()).build().unwrap();
        assert_eq!(both.dependencies().access(), DependencyAccess::Wildcard);
        assert!(both.dependencies().allows_read(FactType::of::<Territory>(), FactType::of::<Account>()));

        let declared = CompositeRule::all("both-declared")
            .child(isolated)
            .child(reader)
            .configure(|b| b.depends_on::<Territory>())
            .build()
            .unwrap();
        assert_eq!(
            declared.dependencies().access(),
            DependencyAccess::Only([FactType::of::<Territory>()].into_iter().collect())
        );
    }
}
