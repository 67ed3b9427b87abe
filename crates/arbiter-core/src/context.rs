//! Evaluation context handed to contextual conditions and actions
//!
//! A [`RuleContext`] is the rule author's window onto the working set. Outside a session it is
//! *detached*: queries it hands out stay deferred and fail with `UnresolvedQuery` when
//! materialized, and fact insertion is refused. Inside `Session::evaluate` it is bound to the
//! stage's [`Rewriter`] and to the session's change buffer.

use crate::dependency::RuleDependencies;
use crate::error::{ArbiterResult, RuleError};
use crate::query::FactQuery;
use crate::rewriter::Rewriter;
use crate::session::{FactCollection, TypedCollection};
use arbiter_types::{Fact, FactType};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;

/// Identity and dependency grants of the rule currently being evaluated
#[derive(Clone, Copy)]
pub struct RuleScope<'r> {
    /// Id of the rule
    pub rule_id: &'r str,
    /// Fact type the rule is registered for
    pub fact_type: FactType,
    /// Dependency declarations of the rule
    pub dependencies: &'r RuleDependencies,
}

impl fmt::Debug for RuleScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleScope")
            .field("rule_id", &self.rule_id)
            .field("fact_type", &self.fact_type)
            .finish()
    }
}

/// Whether a buffered change adds or removes a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Retract,
}

/// Fact mutation requested by an action, applied at the next stage boundary
pub struct PendingChange {
    pub(crate) fact_type: FactType,
    pub(crate) kind: ChangeKind,
    pub(crate) fact: Box<dyn Any + Send>,
    pub(crate) rule_id: Option<String>,
    pub(crate) collection: fn() -> Box<dyn FactCollection>,
}

impl fmt::Debug for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChange")
            .field("fact_type", &self.fact_type)
            .field("kind", &self.kind)
            .field("rule_id", &self.rule_id)
            .finish()
    }
}

/// Context passed to contextual conditions and actions
pub struct RuleContext<'s> {
    rewriter: Option<&'s Rewriter>,
    outbox: Option<&'s RefCell<Vec<PendingChange>>>,
    scope: Option<RuleScope<'s>>,
}

impl RuleContext<'static> {
    /// Context with no session behind it
    pub fn detached() -> Self {
        Self { rewriter: None, outbox: None, scope: None }
    }
}

impl<'s> RuleContext<'s> {
    /// Context bound to a rewriter and a change buffer
    pub fn bound(rewriter: &'s Rewriter, outbox: &'s RefCell<Vec<PendingChange>>) -> Self {
        Self { rewriter: Some(rewriter), outbox: Some(outbox), scope: None }
    }

    /// Context that can read through `rewriter` but cannot emit facts
    pub fn read_only(rewriter: &'s Rewriter) -> Self {
        Self { rewriter: Some(rewriter), outbox: None, scope: None }
    }

    /// Same bindings, scoped to one rule
    pub fn scoped<'r>(&'r self, scope: RuleScope<'r>) -> RuleContext<'r> {
        RuleContext { rewriter: self.rewriter, outbox: self.outbox, scope: Some(scope) }
    }

    /// Whether queries from this context resolve against session data
    pub fn is_bound(&self) -> bool {
        self.rewriter.is_some()
    }

    /// Rule currently being evaluated
    pub fn rule_id(&self) -> Option<&str> {
        self.scope.map(|s| s.rule_id)
    }

    /// Scope of the rule currently being evaluated
    pub fn scope(&self) -> Option<RuleScope<'s>> {
        self.scope
    }

    /// Deferred query over the current facts of type `T`.
    ///
    /// Bound contexts return a query the rewriter has already substituted with the stage
    /// snapshot; detached contexts return a deferred query that refuses to materialize.
    pub fn facts<'q, T: Fact>(&self) -> FactQuery<'q, T> {
        let query = FactQuery::deferred();
        match self.rewriter {
            Some(rewriter) => rewriter.rewrite(self.scope.as_ref(), query),
            None => query,
        }
    }

    /// Ask the session to add `fact` once the current stage completes
    pub fn insert<T: Fact>(&self, fact: T) -> ArbiterResult<()> {
        self.push(ChangeKind::Insert, fact)
    }

    /// Ask the session to remove `fact` once the current stage completes
    pub fn retract<T: Fact>(&self, fact: T) -> ArbiterResult<()> {
        self.push(ChangeKind::Retract, fact)
    }

    fn push<T: Fact>(&self, kind: ChangeKind, fact: T) -> ArbiterResult<()> {
        let fact_type = FactType::of::<T>();
        let rule_id = self.rule_id();

        let Some(outbox) = self.outbox else {
            return Err(RuleError::evaluation(format!(
                "cannot {} {fact_type} fact: no session is attached to this evaluation",
                if kind == ChangeKind::Insert { "insert" } else { "retract" }
            ))
            .with_rule(rule_id.unwrap_or_default()));
        };

        if let Some(scope) = &self.scope {
            if !scope.dependencies.produces(fact_type) {
                return Err(RuleError::dependency(
                    Some(scope.rule_id),
                    fact_type.name(),
                    "rule emits a fact type it does not declare; add produces::<T>() to the rule",
                ));
            }
        }

        outbox.borrow_mut().push(PendingChange {
            fact_type,
            kind,
            fact: Box::new(fact),
            rule_id: rule_id.map(str::to_string),
            collection: TypedCollection::<T>::boxed,
        });
        Ok(())
    }
}

impl fmt::Debug for RuleContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleContext")
            .field("bound", &self.is_bound())
            .field("scope", &self.scope)
            .finish()
    }
}
