//! Evaluation traces for debugging rule conditions

use serde::Serialize;
use std::fmt;

/// Outcome of one visited condition node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceOutcome {
    Matched,
    NotMatched,
    Failed(String),
}

/// One visited node of a condition tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    /// Nesting depth, 0 for the root
    pub depth: usize,
    /// Node description, e.g. `all(2)` or `exists Territory`
    pub node: String,
    pub outcome: TraceOutcome,
}

/// Pre-order record of the condition nodes visited during one evaluation.
///
/// Children skipped by short-circuiting are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Trace {
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a node whose outcome is not known yet
    pub(crate) fn open(&mut self, depth: usize, node: String) -> usize {
        self.entries.push(TraceEntry { depth, node, outcome: TraceOutcome::NotMatched });
        self.entries.len() - 1
    }

    pub(crate) fn close(&mut self, slot: usize, outcome: TraceOutcome) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.outcome = outcome;
        }
    }

    /// Number of visited nodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose evaluation failed
    pub fn failures(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(|e| matches!(e.outcome, TraceOutcome::Failed(_)))
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let mark = match &entry.outcome {
                TraceOutcome::Matched => "✓".to_string(),
                TraceOutcome::NotMatched => "✗".to_string(),
                TraceOutcome::Failed(msg) => format!("! {msg}"),
            };
            writeln!(f, "{:indent$}{} {}", "", entry.node, mark, indent = entry.depth * 2)?;
        }
        Ok(())
    }
}
