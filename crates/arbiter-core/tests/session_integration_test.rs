//! Multi-type sessions: cross-fact rules, dependency ordering and error collection

use arbiter_core::prelude::*;
use arbiter_core::{DependencyKind, ExecutionOutcome, FatalKind};

#[derive(Debug, Clone, PartialEq)]
struct Message {
    sender: String,
    role: String,
    family: String,
}

impl Fact for Message {}

#[derive(Debug, Clone, PartialEq)]
struct Territory {
    name: String,
    controller: String,
}

impl Fact for Territory {}

#[derive(Debug, Clone, PartialEq)]
struct Flag {
    sender: String,
}

impl Fact for Flag {}

#[derive(Debug, Clone, PartialEq)]
struct Invoice {
    amount: i64,
}

impl Fact for Invoice {}

#[derive(Debug, Clone, PartialEq)]
struct Payment {
    amount: i64,
}

impl Fact for Payment {}

fn message(sender: &str, role: &str, family: &str) -> Message {
    Message { sender: sender.to_string(), role: role.to_string(), family: family.to_string() }
}

fn territory(name: &str, controller: &str) -> Territory {
    Territory { name: name.to_string(), controller: controller.to_string() }
}

/// Block envoys writing while some territory is held by another family
fn block_envoys() -> Rule<Message> {
    Rule::builder("block-envoy")
        .priority(10)
        .tag("blocked")
        .when_with_context(|m: &Message, ctx| {
            if m.role != "envoy" {
                return Ok(false);
            }
            ctx.facts::<Territory>().any_where(|t| t.controller != m.family)
        })
        .depends_on::<Territory>()
        .build()
        .unwrap()
}

fn territory_session() -> Session {
    let mut session = Session::new();
    session.register_fact_type::<Territory>();
    session.add_rule_set(ImmutableEngine::new().with_rule(block_envoys()).unwrap()).unwrap();
    session
}

#[test]
fn test_cross_fact_rule_reads_current_session_contents() {
    let mut session = territory_session();
    session
        .insert_all([territory("north", "stark"), territory("vale", "arryn")])
        .unwrap();
    session
        .insert_all([
            message("ned", "envoy", "stark"),
            message("jon", "ranger", "stark"),
            message("lysa", "envoy", "arryn"),
        ])
        .unwrap();

    let result = session.evaluate().unwrap();
    assert_eq!(result.stages, vec![FactType::of::<Message>()]);
    assert!(result.matched::<Message>(0, "block-envoy"));
    assert!(!result.matched::<Message>(1, "block-envoy"));
    assert!(result.matched::<Message>(2, "block-envoy"));
    assert!(!result.has_errors());

    // Retracting the foreign territory changes the next batch
    assert!(session.retract(&territory("vale", "arryn")));
    let result = session.evaluate().unwrap();
    assert!(!result.matched::<Message>(0, "block-envoy"));
    assert!(result.matched::<Message>(2, "block-envoy"));
}

#[test]
fn test_zero_dependency_facts_evaluate_against_an_empty_set() {
    let rules = ImmutableEngine::new()
        .with_rules([
            block_envoys(),
            Rule::builder("unclaimed")
                .condition(Condition::not_exists::<Territory>(|m: &Message, t: &Territory| {
                    t.controller == m.family
                }))
                .build()
                .unwrap(),
            Rule::builder("claimed")
                .condition(Condition::exists::<Territory>(|m: &Message, t: &Territory| {
                    t.controller == m.family
                }))
                .build()
                .unwrap(),
        ])
        .unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Territory>();
    session.add_rule_set(rules).unwrap();
    session.insert(message("ned", "envoy", "stark")).unwrap();

    let result = session.evaluate().unwrap();
    assert!(!result.has_errors());
    assert_eq!(result.matched_rule_ids::<Message>().into_iter().collect::<Vec<_>>(), vec!["unclaimed"]);
}

#[test]
fn test_dependent_stage_runs_after_its_dependency() {
    let annexations = ImmutableEngine::new()
        .with_rule(
            Rule::builder("annex")
                .when(|t: &Territory| t.controller.is_empty())
                .then_with_context(|t, ctx| ctx.insert(Flag { sender: t.name.clone() }))
                .isolated()
                .produces::<Flag>()
                .build()
                .unwrap(),
        )
        .unwrap();
    let flagged_senders = ImmutableEngine::new()
        .with_rule(
            Rule::builder("flagged-sender")
                .condition(Condition::exists::<Flag>(|m: &Message, f: &Flag| f.sender == m.sender))
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Flag>();
    session.add_rule_set(flagged_senders).unwrap();
    session.add_rule_set(annexations).unwrap();

    let plan = session.execution_plan().unwrap();
    assert!(plan.position(FactType::of::<Territory>()) < plan.position(FactType::of::<Message>()));
    assert!(plan.edges.iter().any(|e| e.kind == DependencyKind::DataFlow && e.rule_id == "flagged-sender"));

    session.insert(territory("riverlands", "")).unwrap();
    session.insert(message("riverlands", "lord", "tully")).unwrap();

    let result = session.evaluate().unwrap();
    assert_eq!(result.changes_applied, 1);
    assert!(result.matched::<Message>(0, "flagged-sender"));
}

#[test]
fn test_facts_emitted_in_a_stage_are_visible_from_the_next_batch() {
    let rules = ImmutableEngine::new()
        .with_rules([
            Rule::builder("flag")
                .when(|m: &Message| m.role == "envoy")
                .then_with_context(|m, ctx| ctx.insert(Flag { sender: m.sender.clone() }))
                .isolated()
                .produces::<Flag>()
                .build()
                .unwrap(),
            Rule::builder("already-flagged")
                .condition(Condition::exists::<Flag>(|m: &Message, f: &Flag| f.sender == m.sender))
                .build()
                .unwrap(),
        ])
        .unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Flag>();
    session.add_rule_set(rules).unwrap();
    session.insert(message("ned", "envoy", "stark")).unwrap();

    let first = session.evaluate().unwrap();
    assert!(first.matched::<Message>(0, "flag"));
    assert!(!first.matched::<Message>(0, "already-flagged"));
    assert_eq!(session.count::<Flag>(), 1);

    let second = session.evaluate().unwrap();
    assert!(second.matched::<Message>(0, "already-flagged"));
    assert_eq!(session.count::<Flag>(), 2);
}

#[test]
fn test_composite_with_an_isolated_child_keeps_undeclared_reads() {
    let envoy = Rule::builder("envoy").when(|m: &Message| m.role == "envoy").isolated().build().unwrap();
    let foreign_territory = Rule::builder("foreign-territory")
        .when_with_context(|m: &Message, ctx| ctx.facts::<Territory>().any_where(|t| t.controller != m.family))
        .build()
        .unwrap();
    let both = CompositeRule::all("both").child(envoy).child(foreign_territory).build().unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Territory>();
    session.add_rule_set(ImmutableEngine::new().with_rule(both).unwrap()).unwrap();
    session.insert(territory("vale", "arryn")).unwrap();
    session.insert(message("ned", "envoy", "stark")).unwrap();

    let plan = session.execution_plan().unwrap();
    assert_eq!(plan.conservative_rules, vec!["both".to_string()]);

    let result = session.evaluate().unwrap();
    assert!(!result.has_errors(), "{:?}", result.errors);
    assert!(result.matched::<Message>(0, "both"));
}

#[test]
fn test_cyclic_rule_sets_are_rejected_at_registration() {
    let invoices = ImmutableEngine::new()
        .with_rule(
            Rule::builder("unpaid")
                .condition(Condition::not_exists::<Payment>(|i: &Invoice, p: &Payment| p.amount == i.amount))
                .build()
                .unwrap(),
        )
        .unwrap();
    let payments = ImmutableEngine::new()
        .with_rule(
            Rule::builder("overpaid")
                .condition(Condition::not_exists::<Invoice>(|p: &Payment, i: &Invoice| i.amount == p.amount))
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Invoice>().register_fact_type::<Payment>();
    session.add_rule_set(invoices).unwrap();
    let err = session.add_rule_set(payments).unwrap_err();

    assert!(matches!(err, RuleError::Dependency { .. }));
    let message = err.to_string();
    assert!(message.contains("Invoice -> Payment -> Invoice"), "{message}");
    assert!(message.contains("depends_on"));
    assert!(!session.has_rule_set::<Payment>());
}

#[test]
fn test_strict_schema_names_the_rule_and_type() {
    let mut session = Session::new();
    let err = session.add_rule_set(ImmutableEngine::new().with_rule(block_envoys()).unwrap()).unwrap_err();
    assert_eq!(err.rule_id(), Some("block-envoy"));
    assert!(matches!(err, RuleError::Dependency { ref fact_type, .. } if fact_type == "Territory"));
}

#[test]
fn test_undeclared_reads_are_dependency_errors() {
    let sneaky = Rule::builder("sneaky")
        .when_with_context(|_: &Message, ctx| ctx.facts::<Flag>().exists())
        .depends_on::<Territory>()
        .build()
        .unwrap();

    let mut session = Session::new();
    session.register_fact_type::<Territory>().register_fact_type::<Flag>();
    session.add_rule_set(ImmutableEngine::new().with_rules([sneaky, block_envoys()]).unwrap()).unwrap();
    session.insert(territory("north", "bolton")).unwrap();
    session
        .insert_all([message("ned", "envoy", "stark"), message("rob", "envoy", "stark")])
        .unwrap();

    let result = session.evaluate().unwrap();
    let errors: Vec<_> = result.errors_for_rule("sneaky").collect();
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0].error, RuleError::Dependency { fact_type, .. } if fact_type == "Flag"));
    // Sibling rules keep running
    assert!(result.matched::<Message>(0, "block-envoy"));
    assert!(result.matched::<Message>(1, "block-envoy"));
}

#[test]
fn test_fatal_action_aborts_evaluate() {
    let rules = ImmutableEngine::new()
        .with_rule(
            Rule::builder("exhaust")
                .when(|_: &Message| true)
                .then(|_| Err(RuleError::fatal(FatalKind::ResourceExhausted, "mailbox full")))
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut session = Session::new();
    session.add_rule_set(rules).unwrap();
    session.insert(message("ned", "envoy", "stark")).unwrap();
    assert!(session.evaluate().unwrap_err().is_fatal());
}

#[test]
fn test_cancellation_is_a_distinct_outcome() {
    let mut session = territory_session();
    session.insert(message("ned", "envoy", "stark")).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = session.evaluate_cancellable(&token).unwrap();
    assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
    assert!(!result.has_errors());
    assert_eq!(result.total_matches(), 0);
}

#[test]
fn test_shared_locked_engine_sees_new_rules() {
    let engine = std::sync::Arc::new(LockedEngine::<Message>::new());
    let mut session = Session::new();
    session.add_shared_rule_set::<Message, _>(std::sync::Arc::clone(&engine)).unwrap();
    session.insert(message("ned", "envoy", "stark")).unwrap();
    assert_eq!(session.evaluate().unwrap().total_matches(), 0);

    engine
        .register_rule(Rule::builder("any-message").when(|_: &Message| true).build().unwrap())
        .unwrap();
    let result = session.evaluate().unwrap();
    assert!(result.matched::<Message>(0, "any-message"));
}
