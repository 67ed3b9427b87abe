//! Fact-type dependency analysis
//!
//! Every rule carries a [`RuleDependencies`] record: the fact types it declared with
//! `depends_on`, the fact types detected from its join conditions, whether it contains opaque
//! closures that may read anything, and the fact types it emits (`produces`).
//!
//! [`DependencyAnalyzer`] turns the records of all rule sets in a session into an
//! [`ExecutionPlan`]:
//!
//! ```text
//! rule sets ─→ edges ─→ Kahn order ─→ stages
//!              T → F when a rule on F reads T,
//!              reads something a rule on T produces,
//!              or a rule on T produces F facts
//! ```
//!
//! Opaque rules without explicit declarations are treated conservatively and depend on every
//! other known fact type. A cycle in the resulting graph is rejected with a
//! [`RuleError::Dependency`] naming the cycle.

use crate::clock::{Clock, system_clock};
use crate::error::{ArbiterResult, RuleError};
use crate::rule::RuleId;
use arbiter_types::FactType;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Fact types a rule reads and emits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDependencies {
    declared: BTreeSet<FactType>,
    explicit: bool,
    detected: BTreeSet<FactType>,
    opaque: bool,
    /// Set when a merged part was opaque without a declaration of its own
    unbounded: bool,
    produces: BTreeSet<FactType>,
}

/// Which fact types a rule may read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyAccess {
    /// Exactly these types
    Only(BTreeSet<FactType>),
    /// Any type; the rule has opaque closures and no explicit declaration
    Wildcard,
}

impl RuleDependencies {
    /// Record an explicit `depends_on` declaration
    #[must_use]
    pub fn declare(mut self, fact_type: FactType) -> Self {
        self.declared.insert(fact_type);
        self.explicit = true;
        self
    }

    /// Declare that the rule reads no other fact type
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.explicit = true;
        self
    }

    /// Record a fact type found in a join condition
    #[must_use]
    pub fn detect(mut self, fact_type: FactType) -> Self {
        self.detected.insert(fact_type);
        self
    }

    /// Mark the rule as containing closures that may read any fact type
    #[must_use]
    pub fn opaque(mut self) -> Self {
        self.opaque = true;
        self
    }

    /// Record a fact type the rule's actions emit
    #[must_use]
    pub fn produce(mut self, fact_type: FactType) -> Self {
        self.produces.insert(fact_type);
        self
    }

    /// Union of two records, used for composite rules
    ///
    /// A declaration on one part never narrows an opaque sibling that declared nothing.
    #[must_use]
    pub fn merge(mut self, other: &RuleDependencies) -> Self {
        self.unbounded = self.is_conservative() || other.is_conservative();
        self.declared.extend(other.declared.iter().copied());
        self.explicit |= other.explicit;
        self.detected.extend(other.detected.iter().copied());
        self.opaque |= other.opaque;
        self.produces.extend(other.produces.iter().copied());
        self
    }

    /// Apply a rule's own declarations over the dependencies found in its condition.
    ///
    /// Only an explicit declaration made on the rule itself bounds an opaque part.
    #[must_use]
    pub fn cover(self, found: &RuleDependencies) -> Self {
        let explicit = self.explicit;
        let mut merged = self.merge(found);
        if explicit {
            merged.unbounded = false;
        }
        merged
    }

    /// Types named with `depends_on`
    pub fn declared(&self) -> &BTreeSet<FactType> {
        &self.declared
    }

    /// Types found in join conditions
    pub fn detected(&self) -> &BTreeSet<FactType> {
        &self.detected
    }

    /// Types the rule may emit
    pub fn produced(&self) -> &BTreeSet<FactType> {
        &self.produces
    }

    /// Whether the rule declared its dependencies explicitly
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Whether the rule contains opaque closures
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Whether the rule is assumed to read every fact type
    pub fn is_conservative(&self) -> bool {
        self.unbounded || (self.opaque && !self.explicit)
    }

    /// Fact types the rule may read
    pub fn access(&self) -> DependencyAccess {
        if self.is_conservative() {
            DependencyAccess::Wildcard
        } else {
            DependencyAccess::Only(self.declared.union(&self.detected).copied().collect())
        }
    }

    /// Whether a rule registered for `own` may read `fact_type`
    pub fn allows_read(&self, fact_type: FactType, own: FactType) -> bool {
        fact_type == own
            || self.declared.contains(&fact_type)
            || self.detected.contains(&fact_type)
            || self.is_conservative()
    }

    /// Whether the rule may emit `fact_type`
    pub fn produces(&self, fact_type: FactType) -> bool {
        self.produces.contains(&fact_type)
    }
}

/// Dependency records of one rule set, keyed by the fact type it evaluates
#[derive(Debug, Clone)]
pub struct RuleSetDependencies {
    /// Fact type the rule set is registered for
    pub fact_type: FactType,
    /// Each rule's id and dependency record
    pub rules: Vec<(RuleId, RuleDependencies)>,
}

/// Why one stage must precede another
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DependencyKind {
    /// Declared with `depends_on`
    Declared,
    /// Found in a join condition
    Detected,
    /// Assumed for an opaque rule without declarations
    Conservative,
    /// A rule on the earlier stage produces a type the later stage reads
    DataFlow,
}

/// One edge of the fact-type graph: `before` runs ahead of `after`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub before: FactType,
    pub after: FactType,
    /// Rule that introduced the edge: the reader on `after`, or the producer of `after`
    pub rule_id: RuleId,
    pub kind: DependencyKind,
}

/// Ordered evaluation stages of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Fact types in evaluation order
    pub stages: Vec<FactType>,
    /// Edges that produced the order
    pub edges: Vec<DependencyEdge>,
    /// Rules whose dependencies were assumed rather than declared
    pub conservative_rules: Vec<RuleId>,
}

impl ExecutionPlan {
    /// Position of `fact_type` in the plan
    pub fn position(&self, fact_type: FactType) -> Option<usize> {
        self.stages.iter().position(|t| *t == fact_type)
    }

    /// Fact types that must run before `fact_type`
    pub fn prerequisites(&self, fact_type: FactType) -> BTreeSet<FactType> {
        self.edges.iter().filter(|e| e.after == fact_type).map(|e| e.before).collect()
    }
}

/// Statistics about the last analysis run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyAnalysisStats {
    pub rule_sets_analyzed: usize,
    pub rules_analyzed: usize,
    pub edges: usize,
    pub conservative_rules: usize,
    pub analysis_time: Duration,
}

/// Builds execution plans from rule-set dependency records
#[derive(Debug)]
pub struct DependencyAnalyzer {
    stats: DependencyAnalysisStats,
    clock: Arc<dyn Clock>,
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self { stats: DependencyAnalysisStats::default(), clock: system_clock() }
    }
}

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyzer that times itself with `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { stats: DependencyAnalysisStats::default(), clock }
    }

    /// Statistics of the last [`DependencyAnalyzer::plan`] call
    pub fn stats(&self) -> &DependencyAnalysisStats {
        &self.stats
    }

    /// Check every declared and detected dependency against the known fact types
    pub fn validate_schema(
        &self,
        rule_set: &RuleSetDependencies,
        known: &BTreeSet<FactType>,
    ) -> ArbiterResult<()> {
        for (rule_id, deps) in &rule_set.rules {
            let referenced = deps.declared().iter().chain(deps.detected()).chain(deps.produced());
            for fact_type in referenced {
                if *fact_type != rule_set.fact_type && !known.contains(fact_type) {
                    return Err(RuleError::dependency(
                        Some(rule_id),
                        fact_type.name(),
                        "fact type is not registered with the session; call register_fact_type first",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Order the rule sets so every stage runs after the stages it reads from
    #[instrument(skip(self, rule_sets, known), fields(rule_sets = rule_sets.len()))]
    pub fn plan(
        &mut self,
        rule_sets: &[RuleSetDependencies],
        known: &BTreeSet<FactType>,
    ) -> ArbiterResult<ExecutionPlan> {
        let start = self.clock.now();
        let nodes: BTreeSet<FactType> = rule_sets.iter().map(|rs| rs.fact_type).collect();

        let mut producers: BTreeMap<FactType, BTreeSet<FactType>> = BTreeMap::new();
        for rule_set in rule_sets {
            for (_, deps) in &rule_set.rules {
                for produced in deps.produced() {
                    producers.entry(*produced).or_default().insert(rule_set.fact_type);
                }
            }
        }

        let mut edges = Vec::new();
        let mut conservative_rules = Vec::new();
        let mut rules_analyzed = 0;

        for rule_set in rule_sets {
            let after = rule_set.fact_type;
            for (rule_id, deps) in &rule_set.rules {
                rules_analyzed += 1;
                let access = deps.access();
                let wildcard = access == DependencyAccess::Wildcard;
                let reads = match access {
                    DependencyAccess::Wildcard => {
                        conservative_rules.push(rule_id.clone());
                        warn!(
                            rule_id = %rule_id,
                            fact_type = %after,
                            "rule has opaque closures and no declared dependencies; \
                             assuming it reads every fact type"
                        );
                        known.clone()
                    }
                    DependencyAccess::Only(reads) => reads,
                };

                for read in reads {
                    if read != after && nodes.contains(&read) {
                        edges.push(DependencyEdge {
                            before: read,
                            after,
                            rule_id: rule_id.clone(),
                            kind: if wildcard {
                                DependencyKind::Conservative
                            } else if deps.detected().contains(&read) {
                                DependencyKind::Detected
                            } else {
                                DependencyKind::Declared
                            },
                        });
                    }
                    for producer in producers.get(&read).into_iter().flatten() {
                        if *producer != after && *producer != read {
                            edges.push(DependencyEdge {
                                before: *producer,
                                after,
                                rule_id: rule_id.clone(),
                                kind: DependencyKind::DataFlow,
                            });
                        }
                    }
                }
            }
        }

        // A stage evaluates its own fact type, so it follows every stage that emits that type
        for rule_set in rule_sets {
            for (rule_id, deps) in &rule_set.rules {
                for produced in deps.produced() {
                    if *produced != rule_set.fact_type && nodes.contains(produced) {
                        edges.push(DependencyEdge {
                            before: rule_set.fact_type,
                            after: *produced,
                            rule_id: rule_id.clone(),
                            kind: DependencyKind::DataFlow,
                        });
                    }
                }
            }
        }

        let stages = topological_order(&nodes, &edges)?;

        self.stats = DependencyAnalysisStats {
            rule_sets_analyzed: rule_sets.len(),
            rules_analyzed,
            edges: edges.len(),
            conservative_rules: conservative_rules.len(),
            analysis_time: self.clock.elapsed_since(start),
        };
        info!(
            stages = stages.len(),
            edges = edges.len(),
            conservative_rules = conservative_rules.len(),
            "execution plan computed"
        );

        Ok(ExecutionPlan { stages, edges, conservative_rules })
    }
}

/// Kahn's algorithm over fact types; ties resolve by type name
fn topological_order(
    nodes: &BTreeSet<FactType>,
    edges: &[DependencyEdge],
) -> ArbiterResult<Vec<FactType>> {
    let mut successors: BTreeMap<FactType, BTreeSet<FactType>> = BTreeMap::new();
    let mut in_degree: BTreeMap<FactType, usize> = nodes.iter().map(|n| (*n, 0)).collect();

    for edge in edges {
        if successors.entry(edge.before).or_default().insert(edge.after) {
            *in_degree.entry(edge.after).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<FactType> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for next in successors.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        debug!(order = ?order, "topological order");
        return Ok(order);
    }

    let remaining: BTreeSet<FactType> =
        nodes.iter().filter(|n| !order.contains(n)).copied().collect();
    let cycle = find_cycle(&remaining, &successors);
    let path = cycle.iter().map(FactType::name).collect::<Vec<_>>().join(" -> ");
    let culprit = cycle
        .windows(2)
        .find_map(|pair| edges.iter().find(|e| e.before == pair[0] && e.after == pair[1]));

    Err(RuleError::dependency(
        culprit.map(|e| e.rule_id.as_str()),
        cycle.first().map_or("<unknown>", FactType::name),
        format!(
            "cyclic fact-type dependency {path}; narrow the rules' dependencies with \
             depends_on::<T>() or isolated()"
        ),
    ))
}

/// A closed path through `remaining`, starting at its smallest type and repeating it at the end
fn find_cycle(
    remaining: &BTreeSet<FactType>,
    successors: &BTreeMap<FactType, BTreeSet<FactType>>,
) -> Vec<FactType> {
    let Some(start) = remaining.first().copied() else {
        return Vec::new();
    };

    // Every node left after Kahn's algorithm keeps a predecessor inside the remainder, so
    // walking predecessors must revisit a node.
    let predecessor = |node: FactType| {
        successors
            .iter()
            .find(|(from, to)| remaining.contains(*from) && to.contains(&node))
            .map(|(from, _)| *from)
    };

    let mut path = vec![start];
    let mut current = start;
    while let Some(prev) = predecessor(current) {
        if let Some(idx) = path.iter().position(|n| *n == prev) {
            let mut cycle = path.split_off(idx);
            cycle.reverse();
            if let Some(min_idx) = cycle.iter().enumerate().min_by_key(|(_, n)| **n).map(|(i, _)| i) {
                cycle.rotate_left(min_idx);
            }
            if let Some(first) = cycle.first().copied() {
                cycle.push(first);
            }
            return cycle;
        }
        path.push(prev);
        current = prev;
    }
    path
}
