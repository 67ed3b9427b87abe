use arbiter_core::prelude::*;
use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Transaction {
    amount: i64,
    merchant: u32,
}

impl Fact for Transaction {
    fn schema() -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::new("amount", FieldKind::Integer),
            FieldSpec::new("merchant", FieldKind::Integer),
        ];
        FIELDS
    }

    fn field(&self, name: &str) -> Option<FactValue> {
        match name {
            "amount" => Some(self.amount.into()),
            "merchant" => Some(i64::from(self.merchant).into()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Blocklist {
    merchant: u32,
}

impl Fact for Blocklist {}

fn generate_rules(count: usize) -> Vec<Rule<Transaction>> {
    (0..count)
        .map(|i| {
            let threshold = (i as i64 % 100) * 10;
            Rule::builder(format!("amount-over-{i}"))
                .priority((i % 7) as i32)
                .expression(Expression::field("amount").gt(Expression::lit(threshold)))
                .build()
                .unwrap()
        })
        .collect()
}

fn generate_transactions(count: usize) -> Vec<Transaction> {
    (0..count)
        .map(|i| Transaction { amount: (i as i64 * 37) % 1_000, merchant: (i % 50) as u32 })
        .collect()
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    group.measurement_time(Duration::from_secs(5));

    for size in [10, 100, 1_000].iter() {
        let immutable = ImmutableEngine::new().with_rules(generate_rules(*size)).unwrap();
        let locked = LockedEngine::new();
        locked.register_rules(generate_rules(*size)).unwrap();
        let fact = Transaction { amount: 500, merchant: 3 };

        group.bench_with_input(BenchmarkId::new("immutable", size), size, |b, _| {
            b.iter(|| black_box(immutable.execute(black_box(&fact)).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("locked", size), size, |b, _| {
            b.iter(|| black_box(locked.execute(black_box(&fact)).unwrap()))
        });
    }
    group.finish();
}

fn bench_with_rule(c: &mut Criterion) {
    let mut group = c.benchmark_group("with_rule");

    for size in [100, 1_000, 10_000].iter() {
        let base = ImmutableEngine::new().with_rules(generate_rules(*size)).unwrap();
        group.bench_with_input(BenchmarkId::new("persistent_insert", size), size, |b, _| {
            b.iter_batched(
                || Rule::builder("extra").priority(3).when(|t: &Transaction| t.amount > 0).build().unwrap(),
                |rule| black_box(base.with_rule(rule).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_evaluate");
    group.sample_size(10);

    for size in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("blocklist_join", size), size, |b, &size| {
            b.iter_batched(
                || {
                    let rules = ImmutableEngine::new()
                        .with_rules(generate_rules(20))
                        .and_then(|engine| {
                            engine.with_rule(
                                Rule::builder("blocked-merchant")
                                    .priority(100)
                                    .condition(Condition::exists::<Blocklist>(|t: &Transaction, entry: &Blocklist| {
                                        entry.merchant == t.merchant
                                    }))
                                    .build()?,
                            )
                        })
                        .unwrap();
                    let mut session = Session::new();
                    session.register_fact_type::<Blocklist>();
                    session.add_rule_set(rules).unwrap();
                    session.insert_all((0..10).map(|merchant| Blocklist { merchant })).unwrap();
                    session.insert_all(generate_transactions(size)).unwrap();
                    session
                },
                |mut session| black_box(session.evaluate().unwrap()),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_execute, bench_with_rule, bench_session);
criterion_main!(benches);
