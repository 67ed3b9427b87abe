//! Property tests for rule scheduling and condition semantics.
//!
//! - Rules run in descending priority, ties in registration order
//! - Both engine variants agree on every result
//! - Empty combinators are vacuous: `all` holds, `any` does not
//! - Queries materialized outside an evaluation are always unresolved

use arbiter_core::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    value: i64,
}

impl Fact for Reading {}

#[derive(Debug, Clone, PartialEq)]
struct Sensor {
    offset: i64,
}

impl Fact for Sensor {}

fn threshold_rule(index: usize, priority: i32, threshold: i64) -> Rule<Reading> {
    Rule::builder(format!("rule-{index}"))
        .priority(priority)
        .when(move |r: &Reading| r.value >= threshold)
        .build()
        .unwrap()
}

fn arb_rules() -> impl Strategy<Value = Vec<(i32, i64)>> {
    prop::collection::vec((-5i32..5, -50i64..50), 0..24)
}

proptest! {
    #[test]
    fn rules_run_in_priority_then_registration_order(specs in arb_rules()) {
        let rules = specs.iter().enumerate().map(|(i, (p, t))| threshold_rule(i, *p, *t));
        let engine = ImmutableEngine::new().with_rules(rules).unwrap();

        let order: Vec<(i32, usize)> = engine
            .rules()
            .iter()
            .map(|r| {
                let index = r.id().trim_start_matches("rule-").parse::<usize>().unwrap();
                (r.priority(), index)
            })
            .collect();

        prop_assert_eq!(order.len(), specs.len());
        for pair in order.windows(2) {
            let ((p1, i1), (p2, i2)) = (pair[0], pair[1]);
            prop_assert!(p1 > p2 || (p1 == p2 && i1 < i2), "{:?} before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn engine_variants_agree(specs in arb_rules(), value in -60i64..60, stop in any::<bool>()) {
        let config = EngineConfig::default().with_stop_on_first_match(stop);
        let immutable = ImmutableEngine::with_config(config.clone())
            .with_rules(specs.iter().enumerate().map(|(i, (p, t))| threshold_rule(i, *p, *t)))
            .unwrap();
        let locked = LockedEngine::with_config(config);
        locked
            .register_rules(specs.iter().enumerate().map(|(i, (p, t))| threshold_rule(i, *p, *t)))
            .unwrap();

        let fact = Reading { value };
        let a = immutable.execute(&fact).unwrap();
        let b = locked.execute(&fact).unwrap();
        prop_assert!(a.same_outcome(&b));

        let expected = specs.iter().filter(|(_, t)| value >= *t).count();
        if stop {
            prop_assert_eq!(a.rules_matched, expected.min(1));
        } else {
            prop_assert_eq!(a.rules_matched, expected);
        }
    }

    #[test]
    fn without_rule_leaves_the_original_intact(specs in arb_rules(), pick in any::<prop::sample::Index>()) {
        prop_assume!(!specs.is_empty());
        let engine = ImmutableEngine::new()
            .with_rules(specs.iter().enumerate().map(|(i, (p, t))| threshold_rule(i, *p, *t)))
            .unwrap();
        let victim = format!("rule-{}", pick.index(specs.len()));

        let smaller = engine.without_rule(&victim).unwrap();
        prop_assert_eq!(smaller.rule_count() + 1, engine.rule_count());
        prop_assert!(!smaller.contains_rule(&victim));
        prop_assert!(engine.contains_rule(&victim));
    }

    #[test]
    fn empty_combinators_are_vacuous(value in any::<i64>()) {
        let fact = Reading { value };
        let ctx = RuleContext::detached();
        prop_assert!(Condition::<Reading>::all(Vec::new()).evaluate(&fact, &ctx).unwrap());
        prop_assert!(!Condition::<Reading>::any(Vec::new()).evaluate(&fact, &ctx).unwrap());

        let all_rule = CompositeRule::<Reading>::all("all-of-nothing").build().unwrap();
        let any_rule = CompositeRule::<Reading>::any("any-of-nothing").build().unwrap();
        prop_assert!(all_rule.evaluate(&fact, &ctx).unwrap());
        prop_assert!(!any_rule.evaluate(&fact, &ctx).unwrap());
    }

    #[test]
    fn detached_queries_never_materialize(offsets in prop::collection::vec(any::<i64>(), 0..8)) {
        let ctx = RuleContext::detached();
        let query = ctx.facts::<Sensor>().filter(move |s| offsets.contains(&s.offset));
        let err = query.to_vec().unwrap_err();
        let unresolved = matches!(err, RuleError::UnresolvedQuery { .. });
        prop_assert!(unresolved);
        prop_assert!(err.to_string().contains("Rewriter"));
    }
}
