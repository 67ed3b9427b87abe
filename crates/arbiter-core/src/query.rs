//! Deferred queries over the session's facts
//!
//! A [`FactQuery`] records a chain of filter/order/skip/take steps against a fact type without
//! touching any data, and [`FactQuery::select`] adds a projection on top. The chain becomes
//! executable only after the [`Rewriter`](crate::Rewriter) binds it to a snapshot; calling a
//! terminal operation on an unbound query yields [`RuleError::UnresolvedQuery`].
//!
//! Every node is inspectable through [`QueryStep`]:
//!
//! ```text
//! Source ─→ Filter | OrderBy | Skip | Take ... ─→ [Project] ─→ Any | First | Count | Collect
//! ```

use crate::error::{ArbiterResult, RuleError};
use arbiter_types::{Fact, FactType};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

enum Source<T> {
    Deferred,
    Bound(Arc<Vec<T>>),
    Failed(RuleError),
}

enum Step<'a, T> {
    Filter(Box<dyn Fn(&T) -> bool + 'a>),
    OrderBy(Box<dyn Fn(&T, &T) -> Ordering + 'a>),
    Skip(usize),
    Take(usize),
}

/// Inspectable description of one query node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryStep {
    /// Root of the query
    Source { fact_type: String, bound: bool },
    Filter,
    OrderBy,
    Skip(usize),
    Take(usize),
    /// Mapping into another type, added by [`FactQuery::select`]
    Project,
    /// Terminal: whether some fact remains
    Any,
    /// Terminal: the first remaining fact
    First,
    /// Terminal: how many facts remain
    Count,
    /// Terminal: every remaining fact
    Collect,
}

/// Lazily evaluated query over all facts of type `T`
pub struct FactQuery<'a, T: Fact> {
    source: Source<T>,
    steps: Vec<Step<'a, T>>,
}

impl<'a, T: Fact> FactQuery<'a, T> {
    /// Query that has not been bound to any data
    pub fn deferred() -> Self {
        Self { source: Source::Deferred, steps: Vec::new() }
    }

    pub(crate) fn bind(mut self, data: Arc<Vec<T>>) -> Self {
        self.source = Source::Bound(data);
        self
    }

    pub(crate) fn fail(mut self, error: RuleError) -> Self {
        self.source = Source::Failed(error);
        self
    }

    /// Fact type the query ranges over
    pub fn fact_type(&self) -> FactType {
        FactType::of::<T>()
    }

    /// Whether the query has been bound to data
    pub fn is_bound(&self) -> bool {
        matches!(self.source, Source::Bound(_))
    }

    /// Steps of the query in application order
    pub fn describe(&self) -> Vec<QueryStep> {
        let mut plan = Vec::with_capacity(self.steps.len() + 1);
        plan.push(QueryStep::Source {
            fact_type: T::type_name().to_string(),
            bound: self.is_bound(),
        });
        plan.extend(self.steps.iter().map(|step| match step {
            Step::Filter(_) => QueryStep::Filter,
            Step::OrderBy(_) => QueryStep::OrderBy,
            Step::Skip(n) => QueryStep::Skip(*n),
            Step::Take(n) => QueryStep::Take(*n),
        }));
        plan
    }

    /// Keep facts matching `predicate`
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + 'a) -> Self {
        self.steps.push(Step::Filter(Box::new(predicate)));
        self
    }

    /// Stable sort by a key, ascending
    #[must_use]
    pub fn order_by<K: Ord>(mut self, key: impl Fn(&T) -> K + 'a) -> Self {
        self.steps.push(Step::OrderBy(Box::new(move |a, b| key(a).cmp(&key(b)))));
        self
    }

    /// Stable sort by a key, descending
    #[must_use]
    pub fn order_by_desc<K: Ord>(mut self, key: impl Fn(&T) -> K + 'a) -> Self {
        self.steps.push(Step::OrderBy(Box::new(move |a, b| key(b).cmp(&key(a)))));
        self
    }

    /// Drop the first `n` facts
    #[must_use]
    pub fn skip(mut self, n: usize) -> Self {
        self.steps.push(Step::Skip(n));
        self
    }

    /// Keep at most `n` facts
    #[must_use]
    pub fn take(mut self, n: usize) -> Self {
        self.steps.push(Step::Take(n));
        self
    }

    /// Map matching facts through `projection`; nothing runs until a terminal is called
    pub fn select<U>(self, projection: impl Fn(&T) -> U + 'a) -> Projection<'a, T, U> {
        Projection { query: self, projection: Box::new(projection) }
    }

    /// Matching facts, cloned
    pub fn to_vec(&self) -> ArbiterResult<Vec<T>> {
        Ok(self.materialize(&[QueryStep::Collect])?.into_iter().cloned().collect())
    }

    /// Whether any fact matches
    pub fn any(&self) -> ArbiterResult<bool> {
        Ok(!self.materialize(&[QueryStep::Any])?.is_empty())
    }

    /// Alias of [`FactQuery::any`]
    pub fn exists(&self) -> ArbiterResult<bool> {
        self.any()
    }

    /// Whether any matching fact also satisfies `predicate`
    pub fn any_where(&self, predicate: impl Fn(&T) -> bool) -> ArbiterResult<bool> {
        Ok(self.materialize(&[QueryStep::Filter, QueryStep::Any])?.into_iter().any(predicate))
    }

    /// Whether every matching fact satisfies `predicate`; true for an empty result
    pub fn all(&self, predicate: impl Fn(&T) -> bool) -> ArbiterResult<bool> {
        let rows = self.materialize(&[QueryStep::Filter, QueryStep::Any])?;
        Ok(!rows.into_iter().any(|fact| !predicate(fact)))
    }

    /// First matching fact
    pub fn first(&self) -> ArbiterResult<Option<T>> {
        Ok(self.materialize(&[QueryStep::First])?.into_iter().next().cloned())
    }

    /// Number of matching facts
    pub fn count(&self) -> ArbiterResult<usize> {
        Ok(self.materialize(&[QueryStep::Count])?.len())
    }

    /// Full node list of a query ending in `tail`
    fn plan_with(&self, tail: &[QueryStep]) -> Vec<QueryStep> {
        let mut plan = self.describe();
        plan.extend_from_slice(tail);
        plan
    }

    /// Run the steps over the bound data; `tail` names the nodes applied afterwards
    fn materialize(&self, tail: &[QueryStep]) -> ArbiterResult<Vec<&T>> {
        let data = match &self.source {
            Source::Bound(data) => data,
            Source::Deferred => return Err(RuleError::unresolved_query(T::type_name())),
            Source::Failed(err) => return Err(err.clone()),
        };
        trace!(plan = ?self.plan_with(tail), facts = data.len(), "materializing query");

        let mut rows: Vec<&T> = data.iter().collect();
        for step in &self.steps {
            match step {
                Step::Filter(predicate) => rows.retain(|fact| predicate(*fact)),
                Step::OrderBy(compare) => rows.sort_by(|a, b| compare(*a, *b)),
                Step::Skip(n) => {
                    let n = (*n).min(rows.len());
                    rows.drain(..n);
                }
                Step::Take(n) => rows.truncate(*n),
            }
        }
        Ok(rows)
    }
}

impl<T: Fact> fmt::Debug for FactQuery<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactQuery").field("steps", &self.describe()).finish()
    }
}

/// A [`FactQuery`] whose results are mapped into `U`
pub struct Projection<'a, T: Fact, U> {
    query: FactQuery<'a, T>,
    projection: Box<dyn Fn(&T) -> U + 'a>,
}

impl<T: Fact, U> Projection<'_, T, U> {
    /// Nodes of the underlying query followed by [`QueryStep::Project`]
    pub fn describe(&self) -> Vec<QueryStep> {
        self.query.plan_with(&[QueryStep::Project])
    }

    pub fn is_bound(&self) -> bool {
        self.query.is_bound()
    }

    /// Every projected value
    pub fn to_vec(&self) -> ArbiterResult<Vec<U>> {
        let rows = self.query.materialize(&[QueryStep::Project, QueryStep::Collect])?;
        Ok(rows.into_iter().map(|fact| (self.projection)(fact)).collect())
    }

    /// Projection of the first matching fact
    pub fn first(&self) -> ArbiterResult<Option<U>> {
        let rows = self.query.materialize(&[QueryStep::Project, QueryStep::First])?;
        Ok(rows.into_iter().next().map(|fact| (self.projection)(fact)))
    }
}

impl<T: Fact, U> fmt::Debug for Projection<'_, T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection").field("steps", &self.describe()).finish()
    }
}
