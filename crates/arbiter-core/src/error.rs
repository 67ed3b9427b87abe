//! Error taxonomy for the Arbiter engine
//!
//! Every failure the engine can report is a [`RuleError`]. The variant decides how the error
//! travels:
//!
//! - **Validation** and **Dependency** errors are raised while a rule or rule set is admitted
//!   and block the registration.
//! - **Evaluation** and **UnresolvedQuery** errors raised by a condition or action are recorded
//!   on that rule's result; sibling rules keep running.
//! - **Fatal** errors abort the current `execute`/`evaluate` call immediately.

use crate::rule::RuleId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of unrecoverable runtime faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatalKind {
    /// Memory, fact count or similar limits exhausted
    ResourceExhausted,
    /// Internal state can no longer be trusted (e.g. a poisoned lock)
    CorruptedInvariant,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::CorruptedInvariant => write!(f, "corrupted invariant"),
        }
    }
}

/// Error type for every engine, session and validator operation
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum RuleError {
    /// Structural problem detected before a rule is admitted
    #[error("validation error: {message}")]
    Validation { message: String, rule_id: Option<RuleId> },

    /// A condition or action failed while being evaluated
    #[error("evaluation error: {message}")]
    Evaluation { message: String, rule_id: Option<RuleId> },

    /// Unrecoverable fault; aborts the current call
    #[error("fatal error ({kind}): {message}")]
    Fatal { kind: FatalKind, message: String },

    /// A rule references a fact type that is not registered or not declared
    #[error("dependency error in rule '{}' on fact type {fact_type}: {message}", .rule_id.as_deref().unwrap_or("<unknown>"))]
    Dependency { message: String, rule_id: Option<RuleId>, fact_type: String },

    /// A `FactQuery` was materialized without being bound to session data
    #[error(
        "unresolved query over {fact_type}: the query was materialized before the Rewriter \
         bound it to session data; obtain it through RuleContext::facts during Session::evaluate \
         or bind it explicitly with Rewriter::rewrite"
    )]
    UnresolvedQuery { fact_type: String },
}

/// Result alias used throughout the crate
pub type ArbiterResult<T> = Result<T, RuleError>;

impl RuleError {
    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), rule_id: None }
    }

    /// Build an evaluation error
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation { message: message.into(), rule_id: None }
    }

    /// Build a fatal error
    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal { kind, message: message.into() }
    }

    /// Build a dependency error naming the offending rule and fact type
    pub fn dependency(
        rule_id: Option<&str>,
        fact_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Dependency {
            message: message.into(),
            rule_id: rule_id.map(str::to_string),
            fact_type: fact_type.into(),
        }
    }

    /// Build an unresolved-query error for the given fact type
    pub fn unresolved_query(fact_type: impl Into<String>) -> Self {
        Self::UnresolvedQuery { fact_type: fact_type.into() }
    }

    /// Attach a rule id to errors that carry one and do not have it yet
    #[must_use]
    pub fn with_rule(mut self, id: &str) -> Self {
        match &mut self {
            Self::Validation { rule_id, .. }
            | Self::Evaluation { rule_id, .. }
            | Self::Dependency { rule_id, .. } => {
                if rule_id.is_none() {
                    *rule_id = Some(id.to_string());
                }
            }
            Self::Fatal { .. } | Self::UnresolvedQuery { .. } => {}
        }
        self
    }

    /// Whether the error must abort the current call
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Rule id carried by the error, if any
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Validation { rule_id, .. }
            | Self::Evaluation { rule_id, .. }
            | Self::Dependency { rule_id, .. } => rule_id.as_deref(),
            Self::Fatal { .. } | Self::UnresolvedQuery { .. } => None,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Evaluation { .. } => "evaluation",
            Self::Fatal { .. } => "fatal",
            Self::Dependency { .. } => "dependency",
            Self::UnresolvedQuery { .. } => "unresolved_query",
        }
    }

    /// Severity for logging and alerting
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Evaluation { .. } => ErrorSeverity::Medium,
            Self::Validation { .. } | Self::Dependency { .. } => ErrorSeverity::High,
            Self::UnresolvedQuery { .. } => ErrorSeverity::High,
            Self::Fatal { .. } => ErrorSeverity::Critical,
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_errors_are_fatal() {
        assert!(RuleError::fatal(FatalKind::ResourceExhausted, "oom").is_fatal());
        assert!(!RuleError::evaluation("boom").is_fatal());
        assert!(!RuleError::unresolved_query("Territory").is_fatal());
    }

    #[test]
    fn with_rule_fills_missing_rule_id_only() {
        let err = RuleError::evaluation("boom").with_rule("r1");
        assert_eq!(err.rule_id(), Some("r1"));

        let err = err.with_rule("r2");
        assert_eq!(err.rule_id(), Some("r1"));
    }

    #[test]
    fn unresolved_query_message_names_the_rewrite_step() {
        let msg = RuleError::unresolved_query("Territory").to_string();
        assert!(msg.contains("Territory"));
        assert!(msg.contains("Rewriter"));
    }

    #[test]
    fn dependency_message_names_rule_and_type() {
        let msg = RuleError::dependency(Some("block-rival"), "Territory", "not registered")
            .to_string();
        assert!(msg.contains("block-rival"));
        assert!(msg.contains("Territory"));
    }

    #[test]
    fn categories_and_severity() {
        assert_eq!(RuleError::validation("x").category(), "validation");
        assert_eq!(
            RuleError::fatal(FatalKind::CorruptedInvariant, "x").severity(),
            ErrorSeverity::Critical
        );
    }
}
