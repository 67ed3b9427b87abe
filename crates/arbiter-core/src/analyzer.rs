//! Offline rule coverage analysis
//!
//! [`RuleAnalyzer`] replays a set of sample facts through an engine's conditions (actions are not
//! run) and reports, for every rule, how often it matched. Rules that never match are reported as
//! dead; pairs of rules whose match sets overlap by more than the threshold (Jaccard index) are
//! reported as redundancy candidates.
//!
//! Samples are evaluated in parallel with rayon. Conditions that read other fact types see the
//! facts of the supplied [`Rewriter`]; with [`RuleAnalyzer::analyze`] they see empty collections.

use crate::clock::{Clock, system_clock};
use crate::context::RuleContext;
use crate::engine::RulesEngine;
use crate::error::ArbiterResult;
use crate::rewriter::Rewriter;
use crate::rule::RuleId;
use arbiter_types::Fact;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Default Jaccard overlap above which two rules are reported together
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.5;

/// How often one rule matched the samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCoverage {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub matches: usize,
    /// Samples on which the condition failed with a non-fatal error
    pub errors: usize,
    /// `matches / samples`, 0.0 for an empty sample set
    pub match_rate: f64,
}

/// Two rules that match largely the same samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOverlap {
    pub first: RuleId,
    pub second: RuleId,
    /// Samples matched by both
    pub shared: usize,
    /// `|A ∩ B| / |A ∪ B|`
    pub jaccard: f64,
}

/// Result of one analysis run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub samples: usize,
    /// One entry per rule, in evaluation order
    pub coverage: Vec<RuleCoverage>,
    /// Rules that matched no sample
    pub dead_rules: Vec<RuleId>,
    pub overlaps: Vec<RuleOverlap>,
    pub generated_at: DateTime<Utc>,
    pub duration: Duration,
}

impl AnalysisReport {
    pub fn coverage_for(&self, rule_id: &str) -> Option<&RuleCoverage> {
        self.coverage.iter().find(|c| c.rule_id == rule_id)
    }

    pub fn is_dead(&self, rule_id: &str) -> bool {
        self.dead_rules.iter().any(|id| id == rule_id)
    }

    /// Whether `a` and `b` were reported as overlapping, in either order
    pub fn overlaps(&self, a: &str, b: &str) -> bool {
        self.overlaps
            .iter()
            .any(|o| (o.first == a && o.second == b) || (o.first == b && o.second == a))
    }

    /// Pretty-printed JSON for review tooling
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Matched,
    NotMatched,
    Failed,
}

/// Sample-driven coverage and redundancy analysis
#[derive(Debug, Clone)]
pub struct RuleAnalyzer {
    overlap_threshold: f64,
    clock: Arc<dyn Clock>,
}

impl Default for RuleAnalyzer {
    fn default() -> Self {
        Self { overlap_threshold: DEFAULT_OVERLAP_THRESHOLD, clock: system_clock() }
    }
}

impl RuleAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report pairs whose Jaccard overlap is strictly above `threshold`
    #[must_use]
    pub fn with_overlap_threshold(mut self, threshold: f64) -> Self {
        self.overlap_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Time and stamp reports with `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Analyze with no other facts available to join conditions
    pub fn analyze<F, E>(&self, engine: &E, samples: &[F]) -> ArbiterResult<AnalysisReport>
    where
        F: Fact,
        E: RulesEngine<F> + ?Sized,
    {
        self.analyze_with_facts(engine, samples, &Rewriter::new())
    }

    /// Analyze with join conditions reading from `facts`.
    ///
    /// Non-fatal condition errors are counted per rule; a fatal error aborts the analysis.
    #[instrument(skip_all, fields(samples = samples.len()))]
    pub fn analyze_with_facts<F, E>(
        &self,
        engine: &E,
        samples: &[F],
        facts: &Rewriter,
    ) -> ArbiterResult<AnalysisReport>
    where
        F: Fact,
        E: RulesEngine<F> + ?Sized,
    {
        let start = self.clock.now();
        let rules = engine.rules();

        let rows: Vec<Vec<Outcome>> = samples
            .par_iter()
            .map(|sample| {
                let ctx = RuleContext::read_only(facts);
                rules
                    .iter()
                    .map(|rule| match rule.evaluate(sample, &ctx) {
                        Ok(true) => Ok(Outcome::Matched),
                        Ok(false) => Ok(Outcome::NotMatched),
                        Err(err) if err.is_fatal() => Err(err),
                        Err(_) => Ok(Outcome::Failed),
                    })
                    .collect::<ArbiterResult<Vec<_>>>()
            })
            .collect::<ArbiterResult<Vec<_>>>()?;

        let matched: Vec<Vec<bool>> = (0..rules.len())
            .map(|r| rows.iter().map(|row| row[r] == Outcome::Matched).collect())
            .collect();

        let coverage: Vec<RuleCoverage> = rules
            .iter()
            .enumerate()
            .map(|(r, rule)| {
                let matches = matched[r].iter().filter(|m| **m).count();
                RuleCoverage {
                    rule_id: rule.id().to_string(),
                    rule_name: rule.name().to_string(),
                    matches,
                    errors: rows.iter().filter(|row| row[r] == Outcome::Failed).count(),
                    match_rate: rate(matches, samples.len()),
                }
            })
            .collect();

        let dead_rules: Vec<RuleId> = if samples.is_empty() {
            Vec::new()
        } else {
            coverage.iter().filter(|c| c.matches == 0).map(|c| c.rule_id.clone()).collect()
        };
        for rule_id in &dead_rules {
            warn!(rule_id = %rule_id, "rule matched none of the samples");
        }

        let mut overlaps = Vec::new();
        for a in 0..rules.len() {
            for b in a + 1..rules.len() {
                let shared = matched[a].iter().zip(&matched[b]).filter(|(x, y)| **x && **y).count();
                let union = matched[a].iter().zip(&matched[b]).filter(|(x, y)| **x || **y).count();
                if union == 0 {
                    continue;
                }
                let jaccard = rate(shared, union);
                if jaccard > self.overlap_threshold {
                    overlaps.push(RuleOverlap {
                        first: rules[a].id().to_string(),
                        second: rules[b].id().to_string(),
                        shared,
                        jaccard,
                    });
                }
            }
        }

        let report = AnalysisReport {
            samples: samples.len(),
            coverage,
            dead_rules,
            overlaps,
            generated_at: self.clock.wall_time(),
            duration: self.clock.elapsed_since(start),
        };
        info!(
            rules = rules.len(),
            dead_rules = report.dead_rules.len(),
            overlaps = report.overlaps.len(),
            "rule analysis complete"
        );
        Ok(report)
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}
