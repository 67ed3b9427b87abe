//! Validator, analyzer and configuration loading as seen from outside the crate

use arbiter_core::prelude::*;
use arbiter_core::{ArbiterConfig, IssueCode, ReadConsistency, RuleAnalyzer, Validator};

#[derive(Debug, Clone, PartialEq)]
struct Account {
    balance: i64,
    limit: Option<i64>,
}

impl Fact for Account {
    fn schema() -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::new("balance", FieldKind::Integer),
            FieldSpec::new("limit", FieldKind::Integer).nullable(),
        ];
        FIELDS
    }

    fn field(&self, name: &str) -> Option<FactValue> {
        match name {
            "balance" => Some(self.balance.into()),
            "limit" => Some(self.limit.into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    value: i64,
}

impl Fact for Sample {
    fn schema() -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[FieldSpec::new("value", FieldKind::Integer)];
        FIELDS
    }

    fn field(&self, name: &str) -> Option<FactValue> {
        (name == "value").then(|| self.value.into())
    }
}

#[test]
fn test_validator_rejects_division_by_zero() {
    let condition: Condition<Account> =
        Condition::expression(Expression::field("balance").div(Expression::lit(0)).gt(Expression::lit(100)));
    let report = Validator::new().validate_condition(&condition);

    assert!(!report.is_valid());
    assert!(report.has(IssueCode::DivisionByZero));
    assert!(report.error_summary().contains("division by zero"));
}

#[test]
fn test_validator_reports_unknown_fields_and_unguarded_nullables() {
    let validator = Validator::new();

    let unknown = validator.validate_expression::<Account>(&Expression::field("overdraft").gt(Expression::lit(0)));
    assert!(unknown.has(IssueCode::UnknownField));

    let unguarded = validator.validate_expression::<Account>(&Expression::field("balance").gt(Expression::field("limit")));
    assert!(unguarded.is_valid());
    assert!(unguarded.warnings.iter().any(|w| w.code == IssueCode::UnguardedNullable));

    let guarded = validator.validate_expression::<Account>(
        &Expression::field("limit")
            .is_present()
            .and(Expression::field("balance").gt(Expression::field("limit"))),
    );
    assert!(guarded.is_valid());
    assert!(guarded.warnings.is_empty());
}

#[test]
fn test_analyzer_flags_dead_and_overlapping_rules() {
    let engine = ImmutableEngine::new()
        .with_rules([
            Rule::builder("huge").expression(Expression::field("value").gt(Expression::lit(1000))).build().unwrap(),
            Rule::builder("upper-half").expression(Expression::field("value").ge(Expression::lit(50))).build().unwrap(),
            Rule::builder("upper-third").expression(Expression::field("value").ge(Expression::lit(66))).build().unwrap(),
        ])
        .unwrap();
    let samples: Vec<Sample> = (0..100).map(|value| Sample { value }).collect();

    let report = RuleAnalyzer::new().analyze(&engine, &samples).unwrap();
    assert_eq!(report.dead_rules, vec!["huge".to_string()]);
    assert_eq!(report.coverage_for("huge").unwrap().match_rate, 0.0);
    assert_eq!(report.coverage_for("upper-half").unwrap().matches, 50);
    // 34 shared of 50 in the union
    assert!(report.overlaps("upper-half", "upper-third"));
    assert!(!report.overlaps("huge", "upper-half"));
}

#[test]
fn test_analyzer_accepts_locked_engines() {
    let engine = LockedEngine::new();
    engine
        .register_rule(Rule::builder("even").when(|s: &Sample| s.value % 2 == 0).build().unwrap())
        .unwrap();
    let samples: Vec<Sample> = (0..10).map(|value| Sample { value }).collect();

    let report = RuleAnalyzer::new().analyze(&engine, &samples).unwrap();
    assert_eq!(report.coverage_for("even").unwrap().matches, 5);
    assert!(report.dead_rules.is_empty());
    // Analysis never runs actions, so it leaves no metrics behind
    assert!(engine.metrics("even").is_none());
}

#[test]
fn test_configuration_from_toml() {
    let config = ArbiterConfig::from_toml_str(
        r#"
        [engine]
        stop_on_first_match = true
        track_performance = false
        read_consistency = "snapshot"

        [session]
        strict_schema = false
        max_facts_per_type = 2
        "#,
    )
    .unwrap();

    assert!(config.engine.stop_on_first_match);
    assert_eq!(config.engine.read_consistency, ReadConsistency::Snapshot);

    let engine = LockedEngine::<Sample>::with_config(config.engine.clone());
    engine
        .register_rules([
            Rule::builder("first").priority(2).condition(Condition::always()).build().unwrap(),
            Rule::builder("second").priority(1).condition(Condition::always()).build().unwrap(),
        ])
        .unwrap();
    let result = engine.execute(&Sample { value: 1 }).unwrap();
    assert_eq!(result.matched_rule_ids(), vec!["first"]);
    assert!(engine.metrics("first").is_none());

    let mut session = Session::with_config(config.session);
    session.insert_all([Sample { value: 1 }, Sample { value: 2 }]).unwrap();
    let err = session.insert(Sample { value: 3 }).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_invalid_configuration_is_reported() {
    let err = ArbiterConfig::from_toml_str("[engine]\nread_consistency = \"sometimes\"").unwrap_err();
    assert!(err.to_string().contains("invalid arbiter configuration"));
}
