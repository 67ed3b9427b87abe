//! Binding of deferred queries to session data
//!
//! During `Session::evaluate` every stage gets a fresh [`Rewriter`] holding an immutable snapshot
//! of all fact collections. [`Rewriter::rewrite`] replaces the deferred source of a
//! [`FactQuery`] with the snapshot of its fact type after checking that:
//!
//! 1. the fact type is part of the session schema (when a schema is set), and
//! 2. the rule doing the read declared, or was detected to need, that fact type.
//!
//! Access grants are cached per rule and fact type, so repeated reads from the same rule across
//! all facts of a stage skip the checks.

use crate::context::RuleScope;
use crate::error::{ArbiterResult, FatalKind, RuleError};
use crate::query::FactQuery;
use arbiter_types::{Fact, FactType};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Type-erased per-type fact collections, each an `Arc<Vec<T>>`
pub type FactSnapshot = HashMap<FactType, Arc<dyn Any + Send + Sync>>;

/// Counters describing the work a rewriter did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RewriteStats {
    /// Queries bound to data
    pub rewrites: usize,
    /// Rewrites that reused a cached access grant
    pub cache_hits: usize,
    /// Rewrites refused because of schema or dependency checks
    pub rejected: usize,
}

impl RewriteStats {
    /// Add another set of counters to this one
    pub fn absorb(&mut self, other: RewriteStats) {
        self.rewrites += other.rewrites;
        self.cache_hits += other.cache_hits;
        self.rejected += other.rejected;
    }
}

/// Binds deferred queries to an immutable fact snapshot
#[derive(Default)]
pub struct Rewriter {
    snapshot: FactSnapshot,
    schema: Option<BTreeSet<FactType>>,
    grants: Mutex<HashSet<(String, FactType)>>,
    rewrites: AtomicUsize,
    cache_hits: AtomicUsize,
    rejected: AtomicUsize,
}

impl Rewriter {
    /// Rewriter over an empty snapshot with no schema restriction
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewriter over a prepared snapshot
    pub fn from_snapshot(snapshot: FactSnapshot, schema: Option<BTreeSet<FactType>>) -> Self {
        debug!(fact_types = snapshot.len(), schema = schema.is_some(), "rewriter created");
        Self { snapshot, schema, ..Self::default() }
    }

    /// Add a collection of facts to the snapshot
    #[must_use]
    pub fn with_facts<T: Fact>(mut self, facts: Vec<T>) -> Self {
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(facts);
        self.snapshot.insert(FactType::of::<T>(), erased);
        self
    }

    /// Restrict readable fact types to `schema`
    #[must_use]
    pub fn with_schema(mut self, schema: impl IntoIterator<Item = FactType>) -> Self {
        self.schema = Some(schema.into_iter().collect());
        self
    }

    /// Bind `query` to the snapshot.
    ///
    /// A refused access does not panic or return early: the returned query carries the error and
    /// reports it from its first terminal operation, so the failing rule records it on its own
    /// result.
    pub fn rewrite<'q, T: Fact>(
        &self,
        scope: Option<&RuleScope<'_>>,
        query: FactQuery<'q, T>,
    ) -> FactQuery<'q, T> {
        let fact_type = FactType::of::<T>();
        if let Err(err) = self.check_access(scope, fact_type) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return query.fail(err);
        }

        match self.collection::<T>() {
            Ok(data) => {
                self.rewrites.fetch_add(1, Ordering::Relaxed);
                trace!(fact_type = %fact_type, facts = data.len(), "query bound");
                query.bind(data)
            }
            Err(err) => query.fail(err),
        }
    }

    /// Snapshot of all facts of type `T`; empty when none were inserted
    pub fn collection<T: Fact>(&self) -> ArbiterResult<Arc<Vec<T>>> {
        let fact_type = FactType::of::<T>();
        match self.snapshot.get(&fact_type) {
            Some(erased) => Arc::clone(erased).downcast::<Vec<T>>().map_err(|_| {
                RuleError::fatal(
                    FatalKind::CorruptedInvariant,
                    format!("snapshot entry for {fact_type} holds a different type"),
                )
            }),
            None => Ok(Arc::new(Vec::new())),
        }
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> RewriteStats {
        RewriteStats {
            rewrites: self.rewrites.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn check_access(&self, scope: Option<&RuleScope<'_>>, fact_type: FactType) -> ArbiterResult<()> {
        let rule_id = scope.map(|s| s.rule_id);

        if let Some(rule_id) = rule_id {
            let grants = self.grants.lock().map_err(|_| {
                RuleError::fatal(FatalKind::CorruptedInvariant, "rewriter grant cache poisoned")
            })?;
            if grants.contains(&(rule_id.to_string(), fact_type)) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        if let Some(schema) = &self.schema {
            if !schema.contains(&fact_type) {
                return Err(RuleError::dependency(
                    rule_id,
                    fact_type.name(),
                    "fact type is not registered with the session",
                ));
            }
        }

        if let Some(scope) = scope {
            if !scope.dependencies.allows_read(fact_type, scope.fact_type) {
                return Err(RuleError::dependency(
                    Some(scope.rule_id),
                    fact_type.name(),
                    "rule reads a fact type outside its declared dependencies; \
                     add depends_on::<T>() to the rule",
                ));
            }

            let mut grants = self.grants.lock().map_err(|_| {
                RuleError::fatal(FatalKind::CorruptedInvariant, "rewriter grant cache poisoned")
            })?;
            grants.insert((scope.rule_id.to_string(), fact_type));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewriter")
            .field("fact_types", &self.snapshot.keys().collect::<BTreeSet<_>>())
            .field("schema", &self.schema)
            .field("stats", &self.stats())
            .finish()
    }
}
