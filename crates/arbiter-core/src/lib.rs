#![warn(clippy::all)]
#![allow(missing_docs)]
//! Core of the Arbiter decision engine.
//!
//! Rules pair a [`Condition`] over a fact type with actions. A [`RulesEngine`] evaluates its rules
//! against one fact in priority order; two variants share the scheduler:
//! [`ImmutableEngine`] (persistent, lock-free reads) and [`LockedEngine`] (mutable behind a
//! `RwLock`). A [`Session`] holds facts of many types, orders their rule sets by fact-type
//! dependencies and lets rules query other fact types through a [`RuleContext`].

/// Offline coverage and redundancy analysis over sample facts
pub mod analyzer;
/// Injectable time source
pub mod clock;
/// Condition trees: closures, expressions, joins and combinators
pub mod condition;
/// Engine and session configuration, TOML loading
pub mod config;
/// Evaluation context handed to rules
pub mod context;
/// Fact-type dependency records and execution planning
pub mod dependency;
/// Engine trait and the immutable and locked variants
pub mod engine;
/// Error taxonomy
pub mod error;
/// Inspectable expression conditions
pub mod expression;
/// Per-rule execution metrics
pub mod metrics;
/// Deferred cross-fact queries
pub mod query;
/// Rule, engine and session results
pub mod result;
/// Binding of deferred queries to session snapshots
pub mod rewriter;
/// Rules, actions and builders
pub mod rule;
/// Multi-type working sets
pub mod session;
/// Tracing subscriber helpers
pub mod telemetry;
/// Condition evaluation traces
pub mod trace;
/// Static rule validation
pub mod validator;

pub use analyzer::{AnalysisReport, RuleAnalyzer, RuleCoverage, RuleOverlap};
pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{Condition, JoinCondition};
pub use config::{ArbiterConfig, EngineConfig, ReadConsistency, SessionConfig};
pub use context::{ChangeKind, RuleContext};
pub use dependency::{
    DependencyAnalyzer, DependencyEdge, DependencyKind, ExecutionPlan, RuleDependencies,
};
pub use engine::{ImmutableEngine, LockedEngine, RulesEngine};
pub use error::{ArbiterResult, ErrorSeverity, FatalKind, RuleError};
pub use expression::{BinaryOperator, Expression, UnaryOperator};
pub use metrics::{MetricsRegistry, PerformanceMetrics};
pub use query::{FactQuery, Projection, QueryStep};
pub use result::{
    EvaluationResult, ExecutionOutcome, FactMatch, RuleResult, RulesEngineResult, SessionError,
};
pub use rewriter::{RewriteStats, Rewriter};
pub use rule::{Action, CompositeOperator, CompositeRule, Rule, RuleBuilder, RuleId};
pub use session::Session;
pub use trace::{Trace, TraceEntry, TraceOutcome};
pub use validator::{IssueCode, ValidationIssue, ValidationReport, Validator};

pub use arbiter_types::{Fact, FactType, FactValue, FieldKind, FieldSpec};

/// Items needed to write and run rules
pub mod prelude {
    pub use crate::{
        ArbiterResult, CompositeRule, Condition, EngineConfig, Expression, Fact, FactType,
        FactValue, FieldKind, FieldSpec, ImmutableEngine, LockedEngine, Rule, RuleContext,
        RuleError, RulesEngine, Session, SessionConfig,
    };
    pub use tokio_util::sync::CancellationToken;
}
