//! Inspectable expression conditions
//!
//! Unlike closure conditions, an [`Expression`] is a data structure: the validator can walk it to
//! find unknown fields, literal division by zero and unguarded nullable reads before a rule is
//! admitted. At runtime fields are read through [`Fact::field`].

use crate::error::{ArbiterResult, RuleError};
use arbiter_types::{Fact, FactValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// AST node of an expression condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Literal value
    Literal(FactValue),

    /// Field of the fact under evaluation
    Field(String),

    /// Binary operation (a + b, a > b, etc.)
    BinaryOp { left: Box<Expression>, operator: BinaryOperator, right: Box<Expression> },

    /// Unary operation (-a, !a)
    UnaryOp { operator: UnaryOperator, operand: Box<Expression> },

    /// `true` when the operand evaluates to `Null`
    IsNull(Box<Expression>),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Logical
    And,
    Or,

    // String operations
    Contains,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    /// Numeric negation (-x)
    Negate,
    /// Logical negation (!x)
    Not,
}

impl BinaryOperator {
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide | Self::Modulo
        )
    }

    /// Comparisons that need both operands to be ordered values
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::LessThan | Self::LessThanOrEqual | Self::GreaterThan | Self::GreaterThanOrEqual
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Contains => "contains",
        }
    }
}

impl Expression {
    /// Field reference
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    /// Literal value
    pub fn lit(value: impl Into<FactValue>) -> Self {
        Self::Literal(value.into())
    }

    pub fn null() -> Self {
        Self::Literal(FactValue::Null)
    }

    pub fn binary(left: Expression, operator: BinaryOperator, right: Expression) -> Self {
        Self::BinaryOp { left: Box::new(left), operator, right: Box::new(right) }
    }

    pub fn unary(operator: UnaryOperator, operand: Expression) -> Self {
        Self::UnaryOp { operator, operand: Box::new(operand) }
    }

    pub fn add(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Add, rhs)
    }

    pub fn sub(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Subtract, rhs)
    }

    pub fn mul(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Multiply, rhs)
    }

    pub fn div(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Divide, rhs)
    }

    pub fn rem(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Modulo, rhs)
    }

    pub fn eq(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Equal, rhs)
    }

    pub fn ne(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::NotEqual, rhs)
    }

    pub fn lt(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::LessThan, rhs)
    }

    pub fn le(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::LessThanOrEqual, rhs)
    }

    pub fn gt(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::GreaterThan, rhs)
    }

    pub fn ge(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::GreaterThanOrEqual, rhs)
    }

    pub fn and(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::And, rhs)
    }

    pub fn or(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Or, rhs)
    }

    pub fn contains(self, rhs: Expression) -> Self {
        Self::binary(self, BinaryOperator::Contains, rhs)
    }

    pub fn negate(self) -> Self {
        Self::unary(UnaryOperator::Negate, self)
    }

    pub fn not(self) -> Self {
        Self::unary(UnaryOperator::Not, self)
    }

    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    /// `self` is present
    pub fn is_present(self) -> Self {
        self.is_null().not()
    }

    /// Every field name the expression reads
    pub fn referenced_fields(&self) -> BTreeSet<&str> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'e>(&'e self, fields: &mut BTreeSet<&'e str>) {
        match self {
            Self::Field(name) => {
                fields.insert(name);
            }
            Self::Literal(_) => {}
            Self::BinaryOp { left, right, .. } => {
                left.collect_fields(fields);
                right.collect_fields(fields);
            }
            Self::UnaryOp { operand, .. } | Self::IsNull(operand) => operand.collect_fields(fields),
        }
    }

    /// Evaluate against `fact`
    pub fn evaluate<F: Fact>(&self, fact: &F) -> ArbiterResult<FactValue> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Field(name) => fact.field(name).ok_or_else(|| {
                RuleError::evaluation(format!("{} has no field '{name}'", F::type_name()))
            }),
            Self::IsNull(operand) => Ok(FactValue::Boolean(operand.evaluate(fact)?.is_null())),
            Self::UnaryOp { operator, operand } => {
                evaluate_unary_op(*operator, &operand.evaluate(fact)?)
            }
            Self::BinaryOp { left, operator: BinaryOperator::And, right } => {
                if !left.evaluate(fact)?.is_truthy() {
                    return Ok(FactValue::Boolean(false));
                }
                Ok(FactValue::Boolean(right.evaluate(fact)?.is_truthy()))
            }
            Self::BinaryOp { left, operator: BinaryOperator::Or, right } => {
                if left.evaluate(fact)?.is_truthy() {
                    return Ok(FactValue::Boolean(true));
                }
                Ok(FactValue::Boolean(right.evaluate(fact)?.is_truthy()))
            }
            Self::BinaryOp { left, operator, right } => {
                let left = left.evaluate(fact)?;
                let right = right.evaluate(fact)?;
                evaluate_binary_op(&left, *operator, &right)
            }
        }
    }

    /// Evaluate against `fact` and require a boolean result
    pub fn evaluate_bool<F: Fact>(&self, fact: &F) -> ArbiterResult<bool> {
        match self.evaluate(fact)? {
            FactValue::Boolean(b) => Ok(b),
            other => Err(RuleError::evaluation(format!(
                "expression `{self}` produced {} instead of a boolean",
                other.type_name()
            ))),
        }
    }
}

fn evaluate_binary_op(
    left: &FactValue,
    operator: BinaryOperator,
    right: &FactValue,
) -> ArbiterResult<FactValue> {
    use {BinaryOperator::*, FactValue::*};

    if operator.is_arithmetic() || operator.is_ordering() {
        if left.is_null() || right.is_null() {
            return Err(RuleError::evaluation(format!(
                "null operand in `{left} {} {right}`; guard nullable fields with is_present()",
                operator.symbol()
            )));
        }
    }

    let overflow = || RuleError::evaluation(format!("integer overflow in `{left} {} {right}`", operator.symbol()));

    match (left, right, operator) {
        (Integer(a), Integer(b), Add) => a.checked_add(*b).map(Integer).ok_or_else(overflow),
        (Integer(a), Integer(b), Subtract) => a.checked_sub(*b).map(Integer).ok_or_else(overflow),
        (Integer(a), Integer(b), Multiply) => a.checked_mul(*b).map(Integer).ok_or_else(overflow),
        (Integer(_), Integer(0), Divide | Modulo) => Err(RuleError::evaluation("division by zero")),
        (Integer(a), Integer(b), Divide) => a.checked_div(*b).map(Integer).ok_or_else(overflow),
        (Integer(a), Integer(b), Modulo) => a.checked_rem(*b).map(Integer).ok_or_else(overflow),

        (Integer(_) | Float(_), Integer(_) | Float(_), Add | Subtract | Multiply | Divide | Modulo) => {
            let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
                return Err(unsupported(left, operator, right));
            };
            if b == 0.0 && matches!(operator, Divide | Modulo) {
                return Err(RuleError::evaluation("division by zero"));
            }
            Ok(Float(match operator {
                Add => a + b,
                Subtract => a - b,
                Multiply => a * b,
                Divide => a / b,
                _ => a % b,
            }))
        }

        (String(a), String(b), Add) => Ok(String(format!("{a}{b}"))),
        (String(a), String(b), Contains) => Ok(Boolean(a.contains(b.as_str()))),
        (Array(items), element, Contains) => {
            Ok(Boolean(items.iter().any(|item| item.loosely_equals(element))))
        }

        (a, b, Equal) => Ok(Boolean(a.loosely_equals(b))),
        (a, b, NotEqual) => Ok(Boolean(!a.loosely_equals(b))),

        (a, b, LessThan | LessThanOrEqual | GreaterThan | GreaterThanOrEqual) => {
            let ordering = a.compare(b).ok_or_else(|| unsupported(left, operator, right))?;
            Ok(Boolean(match operator {
                LessThan => ordering.is_lt(),
                LessThanOrEqual => ordering.is_le(),
                GreaterThan => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }

        _ => Err(unsupported(left, operator, right)),
    }
}

fn unsupported(left: &FactValue, operator: BinaryOperator, right: &FactValue) -> RuleError {
    RuleError::evaluation(format!(
        "unsupported operation: {} {} {}",
        left.type_name(),
        operator.symbol(),
        right.type_name()
    ))
}

fn evaluate_unary_op(operator: UnaryOperator, operand: &FactValue) -> ArbiterResult<FactValue> {
    match (operator, operand) {
        (UnaryOperator::Negate, FactValue::Integer(n)) => n
            .checked_neg()
            .map(FactValue::Integer)
            .ok_or_else(|| RuleError::evaluation("integer overflow in negation")),
        (UnaryOperator::Negate, FactValue::Float(f)) => Ok(FactValue::Float(-f)),
        (UnaryOperator::Not, value) => Ok(FactValue::Boolean(!value.is_truthy())),
        (UnaryOperator::Negate, other) => {
            Err(RuleError::evaluation(format!("cannot negate {}", other.type_name())))
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Field(name) => write!(f, "{name}"),
            Self::BinaryOp { left, operator, right } => {
                write!(f, "({left} {} {right})", operator.symbol())
            }
            Self::UnaryOp { operator: UnaryOperator::Negate, operand } => write!(f, "-{operand}"),
            Self::UnaryOp { operator: UnaryOperator::Not, operand } => write!(f, "!{operand}"),
            Self::IsNull(operand) => write!(f, "is_null({operand})"),
        }
    }
}
