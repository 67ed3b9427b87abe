//! Rule conditions
//!
//! A [`Condition`] is a tree with three kinds of leaves:
//!
//! - **closures** over the fact (`when`) or the fact plus a [`RuleContext`] (`when_with_context`).
//!   Contextual closures are opaque to dependency analysis.
//! - **expressions** ([`Expression`]) that the validator can inspect.
//! - **joins** (`exists`, `not_exists`, `count_at_least`) correlating the fact with facts of
//!   another type. Their fact type is known statically.
//!
//! Leaves combine with `all` (empty is true), `any` (empty is false) and `not`.

use crate::context::RuleContext;
use crate::dependency::RuleDependencies;
use crate::error::{ArbiterResult, RuleError};
use crate::expression::Expression;
use crate::trace::{Trace, TraceOutcome};
use arbiter_types::{Fact, FactType};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Closure over the fact alone
pub type PredicateFn<F> = Arc<dyn Fn(&F) -> ArbiterResult<bool> + Send + Sync>;

/// Closure over the fact and the evaluation context
pub type ContextPredicateFn<F> =
    Arc<dyn Fn(&F, &RuleContext<'_>) -> ArbiterResult<bool> + Send + Sync>;

/// Condition correlating the fact under evaluation with facts of another type
pub trait JoinCondition<F: Fact>: Send + Sync {
    /// Fact type the join reads
    fn source(&self) -> FactType;

    /// Short description for traces
    fn describe(&self) -> String;

    fn evaluate(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Exists,
    NotExists,
    AtLeast(usize),
}

struct Join<F, T> {
    kind: JoinKind,
    matches: Arc<dyn Fn(&F, &T) -> bool + Send + Sync>,
    _types: PhantomData<fn() -> (F, T)>,
}

impl<F: Fact, T: Fact> JoinCondition<F> for Join<F, T> {
    fn source(&self) -> FactType {
        FactType::of::<T>()
    }

    fn describe(&self) -> String {
        match self.kind {
            JoinKind::Exists => format!("exists {}", T::type_name()),
            JoinKind::NotExists => format!("not exists {}", T::type_name()),
            JoinKind::AtLeast(n) => format!("at least {n} {}", T::type_name()),
        }
    }

    fn evaluate(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<bool> {
        let query = ctx.facts::<T>().filter(|other| (self.matches)(fact, other));
        match self.kind {
            JoinKind::Exists => query.any(),
            JoinKind::NotExists => query.any().map(|found| !found),
            JoinKind::AtLeast(n) => query.count().map(|count| count >= n),
        }
    }
}

/// Condition tree evaluated against a fact of type `F`
pub enum Condition<F: Fact> {
    /// Constant outcome
    Constant(bool),
    Predicate(PredicateFn<F>),
    Contextual(ContextPredicateFn<F>),
    Expression(Expression),
    Join(Arc<dyn JoinCondition<F>>),
    All(Vec<Condition<F>>),
    Any(Vec<Condition<F>>),
    Not(Box<Condition<F>>),
}

impl<F: Fact> Clone for Condition<F> {
    fn clone(&self) -> Self {
        match self {
            Self::Constant(b) => Self::Constant(*b),
            Self::Predicate(p) => Self::Predicate(Arc::clone(p)),
            Self::Contextual(p) => Self::Contextual(Arc::clone(p)),
            Self::Expression(e) => Self::Expression(e.clone()),
            Self::Join(j) => Self::Join(Arc::clone(j)),
            Self::All(children) => Self::All(children.clone()),
            Self::Any(children) => Self::Any(children.clone()),
            Self::Not(child) => Self::Not(child.clone()),
        }
    }
}

impl<F: Fact> Condition<F> {
    /// Always matches
    pub fn always() -> Self {
        Self::Constant(true)
    }

    /// Never matches
    pub fn never() -> Self {
        Self::Constant(false)
    }

    /// Infallible closure over the fact
    pub fn when(predicate: impl Fn(&F) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(move |fact: &F| Ok::<_, RuleError>(predicate(fact))))
    }

    /// Fallible closure over the fact
    pub fn try_when(predicate: impl Fn(&F) -> ArbiterResult<bool> + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    /// Closure over the fact and the evaluation context
    pub fn when_with_context(
        predicate: impl Fn(&F, &RuleContext<'_>) -> ArbiterResult<bool> + Send + Sync + 'static,
    ) -> Self {
        Self::Contextual(Arc::new(predicate))
    }

    pub fn expression(expression: Expression) -> Self {
        Self::Expression(expression)
    }

    /// Some fact of type `T` correlates with the fact
    pub fn exists<T: Fact>(matches: impl Fn(&F, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::join::<T>(JoinKind::Exists, matches)
    }

    /// No fact of type `T` correlates with the fact
    pub fn not_exists<T: Fact>(matches: impl Fn(&F, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::join::<T>(JoinKind::NotExists, matches)
    }

    /// At least `n` facts of type `T` correlate with the fact
    pub fn count_at_least<T: Fact>(
        n: usize,
        matches: impl Fn(&F, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::join::<T>(JoinKind::AtLeast(n), matches)
    }

    fn join<T: Fact>(kind: JoinKind, matches: impl Fn(&F, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::Join(Arc::new(Join::<F, T> { kind, matches: Arc::new(matches), _types: PhantomData }))
    }

    pub fn all(children: Vec<Condition<F>>) -> Self {
        Self::All(children)
    }

    pub fn any(children: Vec<Condition<F>>) -> Self {
        Self::Any(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Condition<F>) -> Self {
        Self::Not(Box::new(child))
    }

    /// `self && other`, flattening nested `all`
    #[must_use]
    pub fn and(self, other: Condition<F>) -> Self {
        match self {
            Self::All(mut children) => {
                children.push(other);
                Self::All(children)
            }
            first => Self::All(vec![first, other]),
        }
    }

    /// `self || other`, flattening nested `any`
    #[must_use]
    pub fn or(self, other: Condition<F>) -> Self {
        match self {
            Self::Any(mut children) => {
                children.push(other);
                Self::Any(children)
            }
            first => Self::Any(vec![first, other]),
        }
    }

    /// Evaluate with short-circuiting
    pub fn evaluate(&self, fact: &F, ctx: &RuleContext<'_>) -> ArbiterResult<bool> {
        self.eval(fact, ctx, None, 0)
    }

    /// Evaluate and record every visited node
    pub fn evaluate_with_trace(&self, fact: &F, ctx: &RuleContext<'_>) -> (ArbiterResult<bool>, Trace) {
        let mut trace = Trace::new();
        let outcome = self.eval(fact, ctx, Some(&mut trace), 0);
        (outcome, trace)
    }

    fn eval(
        &self,
        fact: &F,
        ctx: &RuleContext<'_>,
        mut trace: Option<&mut Trace>,
        depth: usize,
    ) -> ArbiterResult<bool> {
        let slot = trace.as_deref_mut().map(|t| t.open(depth, self.describe()));

        let outcome = match self {
            Self::Constant(b) => Ok(*b),
            Self::Predicate(predicate) => predicate(fact),
            Self::Contextual(predicate) => predicate(fact, ctx),
            Self::Expression(expression) => expression.evaluate_bool(fact),
            Self::Join(join) => join.evaluate(fact, ctx),
            Self::All(children) => {
                let mut result = Ok(true);
                for child in children {
                    match child.eval(fact, ctx, trace.as_deref_mut(), depth + 1) {
                        Ok(true) => {}
                        other => {
                            result = other;
                            break;
                        }
                    }
                }
                result
            }
            Self::Any(children) => {
                let mut result = Ok(false);
                for child in children {
                    match child.eval(fact, ctx, trace.as_deref_mut(), depth + 1) {
                        Ok(false) => {}
                        other => {
                            result = other;
                            break;
                        }
                    }
                }
                result
            }
            Self::Not(child) => child.eval(fact, ctx, trace.as_deref_mut(), depth + 1).map(|b| !b),
        };

        if let (Some(trace), Some(slot)) = (trace, slot) {
            trace.close(
                slot,
                match &outcome {
                    Ok(true) => TraceOutcome::Matched,
                    Ok(false) => TraceOutcome::NotMatched,
                    Err(err) => TraceOutcome::Failed(err.to_string()),
                },
            );
        }
        outcome
    }

    /// Short description of this node
    pub fn describe(&self) -> String {
        match self {
            Self::Constant(b) => b.to_string(),
            Self::Predicate(_) => "predicate".to_string(),
            Self::Contextual(_) => "contextual predicate".to_string(),
            Self::Expression(expression) => expression.to_string(),
            Self::Join(join) => join.describe(),
            Self::All(children) => format!("all({})", children.len()),
            Self::Any(children) => format!("any({})", children.len()),
            Self::Not(_) => "not".to_string(),
        }
    }

    /// Fact types the condition reads, found by walking the tree
    pub fn dependencies(&self) -> RuleDependencies {
        let mut deps = RuleDependencies::default();
        self.visit(&mut |node| match node {
            Self::Join(join) => deps = std::mem::take(&mut deps).detect(join.source()),
            Self::Contextual(_) => deps = std::mem::take(&mut deps).opaque(),
            _ => {}
        });
        deps
    }

    /// Every expression leaf, in pre-order
    pub fn expressions(&self) -> Vec<&Expression> {
        let mut found = Vec::new();
        self.collect_expressions(&mut found);
        found
    }

    fn collect_expressions<'c>(&'c self, found: &mut Vec<&'c Expression>) {
        match self {
            Self::Expression(expression) => found.push(expression),
            Self::All(children) | Self::Any(children) => {
                children.iter().for_each(|c| c.collect_expressions(found));
            }
            Self::Not(child) => child.collect_expressions(found),
            _ => {}
        }
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Condition<F>)) {
        visitor(self);
        match self {
            Self::All(children) | Self::Any(children) => {
                children.iter().for_each(|c| c.visit(visitor));
            }
            Self::Not(child) => child.visit(visitor),
            _ => {}
        }
    }
}

impl<F: Fact> From<Expression> for Condition<F> {
    fn from(expression: Expression) -> Self {
        Self::Expression(expression)
    }
}

impl<F: Fact> fmt::Debug for Condition<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All(children) => f.debug_tuple("All").field(children).finish(),
            Self::Any(children) => f.debug_tuple("Any").field(children).finish(),
            Self::Not(child) => f.debug_tuple("Not").field(child).finish(),
            other => write!(f, "Condition({})", other.describe()),
        }
    }
}
