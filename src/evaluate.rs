//! Evaluation pass: run the active rules over one tree

use crate::diagnostic::{Diagnostic, DiagnosticSet};
use crate::registry::{ActiveRule, ActiveRuleSet};
use crate::rule::RuleContext;
use crate::span::Span;
use crate::tree::{Suppression, Tree};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Per-rule timing statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTiming {
    /// Rule ID
    pub rule_id: String,
    /// Total time spent on this rule
    pub total_time: Duration,
    /// Number of times the rule was evaluated
    pub evaluation_count: usize,
    /// Number of diagnostics it reported (before suppression)
    pub match_count: usize,
}

impl RuleTiming {
    /// Create a new timing entry
    pub fn new(rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            ..Default::default()
        }
    }

    /// Average time per evaluation
    pub fn avg_time(&self) -> Duration {
        if self.evaluation_count > 0 {
            self.total_time / self.evaluation_count as u32
        } else {
            Duration::ZERO
        }
    }

    /// Fold another measurement of the same rule into this one
    pub fn absorb(&mut self, other: &RuleTiming) {
        self.total_time += other.total_time;
        self.evaluation_count += other.evaluation_count;
        self.match_count += other.match_count;
    }
}

/// Merge timing entries keyed by rule id
pub fn merge_timings(into: &mut HashMap<String, RuleTiming>, timings: &[RuleTiming]) {
    for timing in timings {
        into.entry(timing.rule_id.clone())
            .or_insert_with(|| RuleTiming::new(&timing.rule_id))
            .absorb(timing);
    }
}

/// Output of one evaluation pass
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Sorted, deduplicated, unsuppressed diagnostics
    pub diagnostics: DiagnosticSet,
    /// Timing per active rule, in registration order
    pub timings: Vec<RuleTiming>,
    /// Diagnostics silenced by suppression markers
    pub suppressed: usize,
    /// Diagnostics dropped because their span left the document
    pub discarded: usize,
}

/// Runs every active rule over the same immutable tree
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    parallel: bool,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl Evaluator {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }

    pub fn evaluate(
        &self,
        tree: &Tree,
        source: &str,
        path: &Path,
        active: &ActiveRuleSet,
    ) -> Evaluation {
        let per_rule: Vec<(Vec<Diagnostic>, RuleTiming)> = if self.parallel {
            active
                .as_slice()
                .par_iter()
                .map(|rule| run_rule(rule, tree, source, path))
                .collect()
        } else {
            active
                .iter()
                .map(|rule| run_rule(rule, tree, source, path))
                .collect()
        };

        let mut raw = Vec::new();
        let mut timings = Vec::with_capacity(per_rule.len());
        let mut discarded = 0;

        for (diagnostics, timing) in per_rule {
            for diag in diagnostics {
                if diag.span.is_well_formed() && diag.span.end <= tree.source_len() {
                    raw.push(diag);
                } else {
                    log::warn!(
                        "{}: rule {} reported span {} outside document of {} bytes",
                        path.display(),
                        diag.rule_id,
                        diag.span,
                        tree.source_len()
                    );
                    discarded += 1;
                }
            }
            timings.push(timing);
        }

        let suppressions = tree.suppressions();
        let before = raw.len();
        raw.retain(|d| !is_suppressed(&suppressions, d));
        let suppressed = before - raw.len();

        let diagnostics = DiagnosticSet::normalize(raw);
        log::debug!(
            "{} ({}): {} rules, {} diagnostics, {} suppressed",
            path.display(),
            tree.version(),
            active.len(),
            diagnostics.len(),
            suppressed
        );

        Evaluation {
            diagnostics,
            timings,
            suppressed,
            discarded,
        }
    }
}

/// Run all active rules and return the report-ordered diagnostics
pub fn evaluate(tree: &Tree, source: &str, path: &Path, active: &ActiveRuleSet) -> DiagnosticSet {
    Evaluator::default()
        .evaluate(tree, source, path, active)
        .diagnostics
}

fn run_rule(
    active: &ActiveRule,
    tree: &Tree,
    source: &str,
    path: &Path,
) -> (Vec<Diagnostic>, RuleTiming) {
    let rule_id = active.id();
    let ctx = RuleContext::new(tree, source, path, rule_id, active.severity, &active.options);

    let start = Instant::now();
    let reported = active.rule.evaluate(&ctx);
    let elapsed = start.elapsed();

    let help = active.rule.description();
    let diagnostics: Vec<Diagnostic> = reported
        .into_iter()
        .map(|mut diag| {
            // The engine owns attribution, whatever the rule filled in.
            diag.rule_id = rule_id.to_string();
            diag.severity = active.severity;
            diag.version = tree.version();
            if diag.help.is_none() {
                diag.help = help.map(String::from);
            }
            diag
        })
        .collect();

    let timing = RuleTiming {
        rule_id: rule_id.to_string(),
        total_time: elapsed,
        evaluation_count: 1,
        match_count: diagnostics.len(),
    };

    (diagnostics, timing)
}

fn is_suppressed(suppressions: &[(Span, Suppression)], diag: &Diagnostic) -> bool {
    suppressions.iter().any(|(span, suppression)| {
        silences(*span, diag.span) && suppression.covers(&diag.rule_id)
    })
}

/// Whether a suppressed node's span covers a diagnostic span
///
/// An empty span marks the gap before the byte at its offset, so an
/// insertion at a node's end offset lies outside that node.
fn silences(node: Span, diag: Span) -> bool {
    if diag.is_empty() && !node.is_empty() {
        node.start <= diag.start && diag.start < node.end
    } else {
        node.contains(diag)
    }
}
