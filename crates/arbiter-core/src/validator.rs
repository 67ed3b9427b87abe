//! Static validation of rule conditions
//!
//! The validator inspects what can be inspected: expression leaves are checked against the field
//! schema of the fact type, combinators are checked for shapes that are legal but almost
//! certainly mistakes. Closures are opaque and pass unchecked. Findings are split into errors,
//! which block registration when `validate_on_register` is set, and warnings, which are logged.
//!
//! Nullable guards are recognised structurally: in `a && b` every field `a` proves present
//! (`x.is_present()`, `x != null`) is guarded inside `b`; in `a || b` every field `a` proves
//! present when false (`x.is_null()`, `x == null`) is guarded inside `b`.

use crate::condition::Condition;
use crate::expression::{BinaryOperator, Expression, UnaryOperator};
use crate::rule::{Rule, RuleId};
use arbiter_types::{Fact, FactValue, FieldKind, FieldSpec};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// What a validation finding is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// Expression names a field the fact type does not expose
    UnknownField,
    /// Expression reads a write-only field
    UnreadableField,
    /// Divisor is a constant zero
    DivisionByZero,
    /// Arithmetic over a value that is not a number
    NonNumericOperand,
    /// Nullable field used where null is an error, without a guard
    UnguardedNullable,
    /// `any` with no children never matches
    EmptyAny,
    /// Negation of an empty combinator is a constant
    ConstantNegation,
    /// Opaque closures and no declared dependencies
    ConservativeDependencies,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::UnknownField => "unknown-field",
            Self::UnreadableField => "unreadable-field",
            Self::DivisionByZero => "division-by-zero",
            Self::NonNumericOperand => "non-numeric-operand",
            Self::UnguardedNullable => "unguarded-nullable",
            Self::EmptyAny => "empty-any",
            Self::ConstantNegation => "constant-negation",
            Self::ConservativeDependencies => "conservative-dependencies",
        };
        f.write_str(code)
    }
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    pub rule_id: Option<RuleId>,
    /// Location in the condition tree, e.g. `all[1].not`
    pub path: String,
}

/// Findings of one validation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// No errors were found; warnings do not count
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error messages joined into one line
    pub fn error_summary(&self) -> String {
        self.errors.iter().map(|issue| issue.message.as_str()).collect::<Vec<_>>().join("; ")
    }

    /// Whether any finding carries `code`
    pub fn has(&self, code: IssueCode) -> bool {
        self.errors.iter().chain(&self.warnings).any(|issue| issue.code == code)
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    fn error(&mut self, code: IssueCode, path: &str, message: String) {
        self.errors.push(ValidationIssue { code, message, rule_id: None, path: path.to_string() });
    }

    fn warning(&mut self, code: IssueCode, path: &str, message: String) {
        self.warnings.push(ValidationIssue { code, message, rule_id: None, path: path.to_string() });
    }

    fn attribute(mut self, rule_id: &str) -> Self {
        for issue in self.errors.iter_mut().chain(self.warnings.iter_mut()) {
            issue.rule_id.get_or_insert_with(|| rule_id.to_string());
        }
        self
    }
}

/// Static checker for conditions and rules
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Check one expression against the schema of `F`
    pub fn validate_expression<F: Fact>(&self, expression: &Expression) -> ValidationReport {
        let mut report = ValidationReport::default();
        ExpressionWalker {
            schema: F::schema(),
            type_name: F::type_name(),
            path: "expression",
            report: &mut report,
        }
        .walk(expression, &BTreeSet::new());
        report
    }

    /// Check every node of a condition tree
    pub fn validate_condition<F: Fact>(&self, condition: &Condition<F>) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.visit_condition(condition, "condition", &mut report);
        report
    }

    /// Check a rule's condition and dependency declarations
    pub fn validate_rule<F: Fact>(&self, rule: &Rule<F>) -> ValidationReport {
        let mut report = self.validate_condition(rule.condition());

        let deps = rule.dependencies();
        if deps.is_conservative() {
            report.warning(
                IssueCode::ConservativeDependencies,
                "rule",
                "rule uses context closures without depends_on or isolated; \
                 it will be ordered after every other fact type"
                    .to_string(),
            );
        }

        let report = report.attribute(rule.id());
        debug!(
            rule_id = %rule.id(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "rule validated"
        );
        report
    }

    fn visit_condition<F: Fact>(&self, condition: &Condition<F>, path: &str, report: &mut ValidationReport) {
        match condition {
            Condition::Expression(expression) => ExpressionWalker {
                schema: F::schema(),
                type_name: F::type_name(),
                path,
                report,
            }
            .walk(expression, &BTreeSet::new()),
            Condition::All(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.visit_condition(child, &format!("{path}.all[{i}]"), report);
                }
            }
            Condition::Any(children) => {
                if children.is_empty() {
                    report.warning(IssueCode::EmptyAny, path, "any() with no children never matches".to_string());
                }
                for (i, child) in children.iter().enumerate() {
                    self.visit_condition(child, &format!("{path}.any[{i}]"), report);
                }
            }
            Condition::Not(child) => {
                if let Condition::All(inner) | Condition::Any(inner) = child.as_ref() {
                    if inner.is_empty() {
                        report.warning(
                            IssueCode::ConstantNegation,
                            path,
                            "negation of an empty combinator is a constant; use always() or never()".to_string(),
                        );
                    }
                }
                self.visit_condition(child, &format!("{path}.not"), report);
            }
            Condition::Constant(_)
            | Condition::Predicate(_)
            | Condition::Contextual(_)
            | Condition::Join(_) => {}
        }
    }
}

struct ExpressionWalker<'a> {
    schema: &'static [FieldSpec],
    type_name: &'static str,
    path: &'a str,
    report: &'a mut ValidationReport,
}

impl ExpressionWalker<'_> {
    fn spec(&self, name: &str) -> Option<&'static FieldSpec> {
        self.schema.iter().find(|spec| spec.name == name)
    }

    fn walk<'e>(&mut self, expression: &'e Expression, guarded: &BTreeSet<&'e str>) {
        match expression {
            Expression::Literal(_) => {}
            Expression::Field(name) => self.check_field(name),
            Expression::IsNull(operand) => self.walk(operand, guarded),
            Expression::UnaryOp { operator, operand } => {
                self.walk(operand, guarded);
                if *operator == UnaryOperator::Negate {
                    self.check_numeric(expression, operand, false);
                    self.check_guarded(expression, operand, guarded);
                }
            }
            Expression::BinaryOp { left, operator: BinaryOperator::And, right } => {
                self.walk(left, guarded);
                let mut inner = guarded.clone();
                inner.extend(present_when_true(left));
                self.walk(right, &inner);
            }
            Expression::BinaryOp { left, operator: BinaryOperator::Or, right } => {
                self.walk(left, guarded);
                let mut inner = guarded.clone();
                inner.extend(present_when_false(left));
                self.walk(right, &inner);
            }
            Expression::BinaryOp { left, operator, right } => {
                self.walk(left, guarded);
                self.walk(right, guarded);

                if operator.is_arithmetic() {
                    let concat = *operator == BinaryOperator::Add;
                    self.check_numeric(expression, left, concat);
                    self.check_numeric(expression, right, concat);
                    if matches!(operator, BinaryOperator::Divide | BinaryOperator::Modulo) && is_constant_zero(right) {
                        self.report.error(
                            IssueCode::DivisionByZero,
                            self.path,
                            format!("division by zero in `{expression}`"),
                        );
                    }
                }
                if operator.is_arithmetic() || operator.is_ordering() || *operator == BinaryOperator::Contains {
                    self.check_guarded(expression, left, guarded);
                    self.check_guarded(expression, right, guarded);
                }
            }
        }
    }

    fn check_field(&mut self, name: &str) {
        match self.spec(name) {
            None => self.report.error(
                IssueCode::UnknownField,
                self.path,
                format!("unknown field '{name}' on {}", self.type_name),
            ),
            Some(spec) if !spec.readable => self.report.error(
                IssueCode::UnreadableField,
                self.path,
                format!("field '{name}' on {} is not readable", self.type_name),
            ),
            Some(_) => {}
        }
    }

    fn check_numeric(&mut self, parent: &Expression, operand: &Expression, allow_string: bool) {
        let kind = match operand {
            Expression::Field(name) => self.spec(name).map(|spec| spec.kind),
            Expression::Literal(value) => literal_kind(value),
            _ => None,
        };
        let Some(kind) = kind else { return };
        if kind.is_numeric() || (allow_string && kind == FieldKind::String) {
            return;
        }
        self.report.error(
            IssueCode::NonNumericOperand,
            self.path,
            format!("arithmetic on non-numeric operand `{operand}` in `{parent}`"),
        );
    }

    fn check_guarded(&mut self, parent: &Expression, operand: &Expression, guarded: &BTreeSet<&str>) {
        let Expression::Field(name) = operand else { return };
        let nullable = self.spec(name).is_some_and(|spec| spec.nullable);
        if nullable && !guarded.contains(name.as_str()) {
            self.report.warning(
                IssueCode::UnguardedNullable,
                self.path,
                format!("nullable field '{name}' used in `{parent}` without an is_present() guard"),
            );
        }
    }
}

fn literal_kind(value: &FactValue) -> Option<FieldKind> {
    match value {
        FactValue::Integer(_) => Some(FieldKind::Integer),
        FactValue::Float(_) => Some(FieldKind::Float),
        FactValue::String(_) => Some(FieldKind::String),
        FactValue::Boolean(_) => Some(FieldKind::Boolean),
        FactValue::Date(_) => Some(FieldKind::Date),
        FactValue::Array(_) | FactValue::Object(_) => Some(FieldKind::Composite),
        FactValue::Null => None,
    }
}

/// Fields that are non-null whenever `expression` is true
fn present_when_true(expression: &Expression) -> BTreeSet<&str> {
    match expression {
        Expression::UnaryOp { operator: UnaryOperator::Not, operand } => present_when_false(operand),
        Expression::BinaryOp { left, operator: BinaryOperator::And, right } => {
            present_when_true(left).into_iter().chain(present_when_true(right)).collect()
        }
        Expression::BinaryOp { left, operator: BinaryOperator::NotEqual, right } => null_comparison(left, right),
        _ => BTreeSet::new(),
    }
}

/// Fields that are non-null whenever `expression` is false
fn present_when_false(expression: &Expression) -> BTreeSet<&str> {
    match expression {
        Expression::IsNull(operand) => match operand.as_ref() {
            Expression::Field(name) => BTreeSet::from([name.as_str()]),
            _ => BTreeSet::new(),
        },
        Expression::UnaryOp { operator: UnaryOperator::Not, operand } => present_when_true(operand),
        Expression::BinaryOp { left, operator: BinaryOperator::Or, right } => {
            present_when_false(left).into_iter().chain(present_when_false(right)).collect()
        }
        Expression::BinaryOp { left, operator: BinaryOperator::Equal, right } => null_comparison(left, right),
        _ => BTreeSet::new(),
    }
}

fn null_comparison<'e>(left: &'e Expression, right: &'e Expression) -> BTreeSet<&'e str> {
    match (left, right) {
        (Expression::Field(name), Expression::Literal(FactValue::Null))
        | (Expression::Literal(FactValue::Null), Expression::Field(name)) => BTreeSet::from([name.as_str()]),
        _ => BTreeSet::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Constant;

impl Fact for Constant {}

/// Divisor that reads no fields and folds to zero
fn is_constant_zero(expression: &Expression) -> bool {
    if !expression.referenced_fields().is_empty() {
        return false;
    }
    match expression.evaluate(&Constant) {
        Ok(value) => value.as_f64() == Some(0.0),
        Err(_) => false,
    }
}
