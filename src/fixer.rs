//! Fix engine: the bounded parse / evaluate / compose / apply loop
//!
//! One engine instance drives one document. Each pass parses the current
//! source version, evaluates the active rules, composes the non-overlapping
//! fixes and applies them, producing the next version. The loop ends when a
//! pass has nothing left to apply, when the pass cap or a repeated source text
//! is hit, when parsing fails, or when the run is cancelled.

use crate::compose::{compose, MalformedFix, PatchError, PatchResult};
use crate::config::DEFAULT_MAX_PASSES;
use crate::diagnostic::{Diagnostic, DiagnosticSet};
use crate::evaluate::{merge_timings, Evaluation, Evaluator, RuleTiming};
use crate::registry::ActiveRuleSet;
use crate::span::{DocumentVersion, SourceText};
use crate::tree::{parse_tree, ParseFailure, Parser, Tree};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Shared flag for cooperative cancellation
///
/// Checked once per pass, after evaluation and before any edit is applied.
/// Once cancelled, the flag stays set for every clone until `reset`.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so later runs proceed
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a fix run stopped before reaching a fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapReason {
    /// `max_passes` patches were applied and fixes remain
    IterationLimit,
    /// A pass reproduced a source text seen earlier in the run
    Oscillation,
}

/// Why a fix run failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixFailure {
    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Terminal state of a fix run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Converged,
    Capped(CapReason),
    Failed(FixFailure),
    Cancelled,
}

impl FixOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, FixOutcome::Converged)
    }

    pub fn is_capped(&self) -> bool {
        matches!(self, FixOutcome::Capped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FixOutcome::Failed(_))
    }
}

impl std::fmt::Display for FixOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixOutcome::Converged => write!(f, "converged"),
            FixOutcome::Capped(CapReason::IterationLimit) => write!(f, "capped (pass limit)"),
            FixOutcome::Capped(CapReason::Oscillation) => write!(f, "capped (oscillation)"),
            FixOutcome::Failed(e) => write!(f, "failed: {}", e),
            FixOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened in one evaluated pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassRecord {
    /// 1-based pass index
    pub pass: usize,
    /// Source version the pass evaluated
    pub version: DocumentVersion,
    /// Diagnostics reported
    pub diagnostics: usize,
    /// Diagnostics carrying a fix
    pub fixable: usize,
    /// Fixes taken into the patch
    pub accepted: usize,
    /// Fixes deferred to the next pass because they overlapped
    pub deferred: usize,
    /// Fixes dropped as malformed
    pub malformed: usize,
    /// Whether the patch was applied
    pub applied: bool,
}

/// Result of running the fix engine on one document
#[derive(Debug, Clone)]
pub struct FixReport {
    /// Last fully applied source text
    pub final_text: String,
    /// Version of `final_text`
    pub final_version: DocumentVersion,
    /// Evaluation of `final_text`
    pub diagnostics: DiagnosticSet,
    /// Passes that applied a patch, at least 1
    pub passes: usize,
    pub outcome: FixOutcome,
    /// One record per evaluation, in order
    pub history: Vec<PassRecord>,
    /// Per-rule timing summed over all passes
    pub timings: Vec<RuleTiming>,
    /// Fixes dropped as malformed during the run
    pub malformed: Vec<MalformedFix>,
}

impl FixReport {
    /// Report for a document that was not processed
    pub fn unchanged(text: &str) -> Self {
        Self {
            final_text: text.to_string(),
            final_version: DocumentVersion::default(),
            diagnostics: DiagnosticSet::default(),
            passes: 1,
            outcome: FixOutcome::Converged,
            history: Vec::new(),
            timings: Vec::new(),
            malformed: Vec::new(),
        }
    }

    /// Whether the final text differs from the input
    pub fn changed(&self) -> bool {
        self.final_version != DocumentVersion::default()
    }
}

enum State {
    Parsing(SourceText),
    Evaluating(SourceText, Tree),
    Composing(SourceText, DiagnosticSet),
    Applying(SourceText, PatchResult),
    Done(FixOutcome),
}

/// Drives one document through the fix loop
pub struct FixEngine<'a> {
    parser: &'a dyn Parser,
    active: &'a ActiveRuleSet,
    evaluator: Evaluator,
    max_passes: usize,
    cancel: Option<CancellationToken>,
}

impl<'a> FixEngine<'a> {
    pub fn new(parser: &'a dyn Parser, active: &'a ActiveRuleSet) -> Self {
        Self {
            parser,
            active,
            evaluator: Evaluator::default(),
            max_passes: DEFAULT_MAX_PASSES,
            cancel: None,
        }
    }

    /// Maximum number of patches applied in one run
    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    /// Run rules of a pass on the rayon pool
    pub fn with_parallel_rules(mut self, parallel: bool) -> Self {
        self.evaluator = Evaluator::new(parallel);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Parse and evaluate once without applying anything
    pub fn check(&self, text: &str, path: &Path) -> Result<Evaluation, ParseFailure> {
        let source = SourceText::new(text);
        let tree = parse_tree(self.parser, &source, path)?;
        let mut eval = self.evaluator.evaluate(&tree, &source.text, path, self.active);

        let composed = compose(eval.diagnostics.as_slice(), &source);
        eval.diagnostics = strip_malformed(eval.diagnostics, &composed.malformed);
        Ok(eval)
    }

    /// Apply fixes until the document is stable or the run is stopped
    pub fn fix(&self, text: &str, path: &Path) -> FixReport {
        let mut run = Run {
            seen: HashSet::from([hash_text(text)]),
            pending_cap: (self.max_passes == 0).then_some(CapReason::IterationLimit),
            ..Run::default()
        };
        let mut state = State::Parsing(SourceText::new(text));

        loop {
            state = match state {
                State::Parsing(source) => match parse_tree(self.parser, &source, path) {
                    Ok(tree) => State::Evaluating(source, tree),
                    Err(failure) => {
                        if run.current.is_none() {
                            run.diagnostics =
                                DiagnosticSet::normalize(vec![failure.to_diagnostic(&source)]);
                        }
                        log::warn!(
                            "{}: parsing {} failed: {}",
                            path.display(),
                            source.version,
                            failure
                        );
                        run.roll_back(source);
                        State::Done(FixOutcome::Failed(failure.into()))
                    }
                },

                State::Evaluating(source, tree) => {
                    let eval = self
                        .evaluator
                        .evaluate(&tree, &source.text, path, self.active);
                    merge_timings(&mut run.timings, &eval.timings);
                    State::Composing(source, eval.diagnostics)
                }

                State::Composing(source, diagnostics) => {
                    let composed = compose(diagnostics.as_slice(), &source);
                    let diagnostics = strip_malformed(diagnostics, &composed.malformed);

                    run.history.push(PassRecord {
                        pass: run.history.len() + 1,
                        version: source.version,
                        diagnostics: diagnostics.len(),
                        fixable: diagnostics.fixable_count(),
                        accepted: composed.accepted.len(),
                        deferred: composed.rejected.len(),
                        malformed: composed.malformed.len(),
                        applied: false,
                    });
                    run.malformed.extend(composed.malformed.iter().cloned());
                    run.settle(source.clone(), diagnostics);

                    if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                        State::Done(FixOutcome::Cancelled)
                    } else if composed.is_empty() {
                        State::Done(FixOutcome::Converged)
                    } else if let Some(reason) = run.pending_cap {
                        State::Done(FixOutcome::Capped(reason))
                    } else {
                        State::Applying(source, composed)
                    }
                }

                State::Applying(source, composed) => match composed.patch.apply(&source) {
                    Ok(next) => {
                        run.applied += 1;
                        if let Some(record) = run.history.last_mut() {
                            record.applied = true;
                        }
                        log::debug!(
                            "{}: pass {} applied {} edits ({} -> {})",
                            path.display(),
                            run.applied,
                            composed.patch.len(),
                            source.version,
                            next.version
                        );

                        if !run.seen.insert(hash_text(&next.text)) {
                            run.pending_cap = Some(CapReason::Oscillation);
                        } else if run.applied >= self.max_passes {
                            run.pending_cap = Some(CapReason::IterationLimit);
                        }
                        State::Parsing(next)
                    }
                    Err(e) => State::Done(FixOutcome::Failed(e.into())),
                },

                State::Done(outcome) => {
                    if outcome.is_capped() {
                        log::warn!(
                            "{}: fix loop {} after {} passes with {} diagnostics left",
                            path.display(),
                            outcome,
                            run.applied,
                            run.diagnostics.len()
                        );
                    }
                    return run.finish(text, outcome);
                }
            };
        }
    }
}

#[derive(Default)]
struct Run {
    /// Last source that was parsed and evaluated
    current: Option<SourceText>,
    /// Its evaluation
    diagnostics: DiagnosticSet,
    applied: usize,
    pending_cap: Option<CapReason>,
    seen: HashSet<u64>,
    history: Vec<PassRecord>,
    timings: HashMap<String, RuleTiming>,
    malformed: Vec<MalformedFix>,
}

impl Run {
    fn settle(&mut self, source: SourceText, diagnostics: DiagnosticSet) {
        self.current = Some(source);
        self.diagnostics = diagnostics;
    }

    /// The patch that produced `failed` is discarded along with it
    fn roll_back(&mut self, failed: SourceText) {
        if failed.version != DocumentVersion::default() {
            self.applied = self.applied.saturating_sub(1);
            if let Some(record) = self.history.last_mut() {
                record.applied = false;
            }
        }
    }

    fn finish(self, input: &str, outcome: FixOutcome) -> FixReport {
        let (final_text, final_version) = match self.current {
            Some(source) => (source.text, source.version),
            None => (input.to_string(), DocumentVersion::default()),
        };

        let mut timings: Vec<RuleTiming> = self.timings.into_values().collect();
        timings.sort_by(|a, b| b.total_time.cmp(&a.total_time).then(a.rule_id.cmp(&b.rule_id)));

        FixReport {
            final_text,
            final_version,
            diagnostics: self.diagnostics,
            passes: self.applied.max(1),
            outcome,
            history: self.history,
            timings,
            malformed: self.malformed,
        }
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Report malformed fixes as plain diagnostics
fn strip_malformed(diagnostics: DiagnosticSet, malformed: &[MalformedFix]) -> DiagnosticSet {
    if malformed.is_empty() {
        return diagnostics;
    }

    let stripped: Vec<Diagnostic> = diagnostics
        .into_iter()
        .map(|d| {
            let is_malformed = malformed.iter().any(|m| {
                m.diagnostic.rule_id == d.rule_id
                    && m.diagnostic.span == d.span
                    && m.diagnostic.message == d.message
            });
            if is_malformed {
                d.without_fix()
            } else {
                d
            }
        })
        .collect();
    DiagnosticSet::normalize(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{Edit, Fix, Severity};
    use crate::registry::ActiveRule;
    use crate::rule::{Rule, RuleContext};
    use crate::span::Span;
    use crate::tree::Node;
    use pretty_assertions::assert_eq;

    /// One `word` node per whitespace-separated token; `#` is a syntax error
    struct WordParser;

    impl Parser for WordParser {
        fn id(&self) -> &str {
            "words"
        }

        fn extensions(&self) -> &[&str] {
            &["txt"]
        }

        fn parse(&self, text: &str, _path: &Path) -> Result<Node, ParseFailure> {
            if let Some(pos) = text.find('#') {
                return Err(ParseFailure::new(Span::new(pos, pos + 1), "unexpected '#'"));
            }

            let mut root = Node::new("document", Span::new(0, text.len()));
            let mut offset = 0;
            for word in text.split(' ') {
                if !word.is_empty() {
                    let span = Span::new(offset, offset + word.len());
                    root = root.with_child(Node::new("word", span).with_attr("name", word));
                }
                offset += word.len() + 1;
            }
            Ok(root)
        }
    }

    /// Replaces every word `from` with `to`
    struct Rename {
        id: &'static str,
        from: &'static str,
        to: &'static str,
    }

    impl Rule for Rename {
        fn id(&self) -> &str {
            self.id
        }

        fn can_fix(&self) -> bool {
            true
        }

        fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic> {
            ctx.tree
                .nodes_of_kind("word")
                .filter(|n| n.name() == Some(self.from))
                .map(|n| {
                    ctx.report(n.span(), &format!("use '{}'", self.to))
                        .with_edit(Edit::replace(n.span(), self.to))
                })
                .collect()
        }
    }

    /// Lowercase words must be uppercase
    struct Upper;

    impl Rule for Upper {
        fn id(&self) -> &str {
            "b-upper"
        }

        fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic> {
            ctx.tree
                .nodes_of_kind("word")
                .filter_map(|n| {
                    let word = n.name()?;
                    (word != word.to_uppercase()).then(|| {
                        ctx.report(n.span(), "uppercase")
                            .with_edit(Edit::replace(n.span(), &word.to_uppercase()))
                    })
                })
                .collect()
        }
    }

    /// Prepends a word forever
    struct Grow;

    impl Rule for Grow {
        fn id(&self) -> &str {
            "grow"
        }

        fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic> {
            vec![ctx.report(Span::empty(0), "more").with_edit(Edit::insert(0, "z "))]
        }
    }

    /// Emits edits in reverse order
    struct Malformed;

    impl Rule for Malformed {
        fn id(&self) -> &str {
            "malformed"
        }

        fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic> {
            vec![ctx.report(Span::new(0, 1), "bad fix").with_fix(Fix::new(vec![
                Edit::insert(1, "x"),
                Edit::insert(0, "y"),
            ]))]
        }
    }

    fn active(rules: Vec<Arc<dyn Rule>>) -> ActiveRuleSet {
        ActiveRuleSet::new(
            rules
                .into_iter()
                .map(|rule| ActiveRule {
                    severity: Severity::Warning,
                    rule,
                    options: serde_json::Value::Null,
                })
                .collect(),
        )
    }

    fn fix(rules: Vec<Arc<dyn Rule>>, text: &str) -> FixReport {
        let set = active(rules);
        FixEngine::new(&WordParser, &set)
            .with_parallel_rules(false)
            .fix(text, Path::new("doc.txt"))
    }

    #[test]
    fn test_single_fix_converges_in_one_pass() {
        let report = fix(
            vec![Arc::new(Rename {
                id: "rename",
                from: "foo",
                to: "bar",
            })],
            "foo baz",
        );

        assert_eq!(report.outcome, FixOutcome::Converged);
        assert_eq!(report.final_text, "bar baz");
        assert_eq!(report.passes, 1);
        assert_eq!(report.final_version, DocumentVersion(1));
        assert!(report.diagnostics.is_empty());
        assert_eq!(report.history.len(), 2);
        assert!(report.history[0].applied);
        assert!(!report.history[1].applied);
    }

    #[test]
    fn test_clean_input_reports_one_pass() {
        let report = fix(
            vec![Arc::new(Rename {
                id: "rename",
                from: "foo",
                to: "bar",
            })],
            "baz",
        );

        assert_eq!(report.outcome, FixOutcome::Converged);
        assert_eq!(report.passes, 1);
        assert!(!report.changed());
    }

    #[test]
    fn test_overlapping_fix_lands_in_second_pass() {
        let report = fix(
            vec![
                Arc::new(Upper),
                Arc::new(Rename {
                    id: "a-rename",
                    from: "foo",
                    to: "bar",
                }),
            ],
            "foo",
        );

        assert_eq!(report.outcome, FixOutcome::Converged);
        assert_eq!(report.final_text, "BAR");
        assert_eq!(report.passes, 2);
        assert_eq!(report.history[0].deferred, 1);
    }

    #[test]
    fn test_oscillation_is_capped() {
        let report = fix(
            vec![
                Arc::new(Rename {
                    id: "x-to-y",
                    from: "x",
                    to: "y",
                }),
                Arc::new(Rename {
                    id: "y-to-x",
                    from: "y",
                    to: "x",
                }),
            ],
            "x",
        );

        assert_eq!(report.outcome, FixOutcome::Capped(CapReason::Oscillation));
        assert_eq!(report.passes, 2);
        assert_eq!(report.final_text, "x");
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_non_confluent_fix_hits_pass_limit() {
        let set = active(vec![Arc::new(Grow)]);
        let report = FixEngine::new(&WordParser, &set)
            .with_max_passes(3)
            .fix("a", Path::new("doc.txt"));

        assert_eq!(report.outcome, FixOutcome::Capped(CapReason::IterationLimit));
        assert_eq!(report.passes, 3);
        assert_eq!(report.final_text, "z z z a");
        // residual violation is still reported against the final text
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics.as_slice()[0].version, DocumentVersion(3));
    }

    #[test]
    fn test_parse_failure_after_fix_rolls_back() {
        let report = fix(
            vec![Arc::new(Rename {
                id: "hash",
                from: "bad",
                to: "#",
            })],
            "ok bad",
        );

        assert!(report.outcome.is_failed());
        assert_eq!(report.final_text, "ok bad");
        assert_eq!(report.final_version, DocumentVersion(0));
        assert_eq!(report.diagnostics.len(), 1);
        assert!(!report.history[0].applied);
    }

    #[test]
    fn test_parse_failure_on_input() {
        let report = fix(vec![Arc::new(Grow)], "a # b");
        assert!(matches!(
            report.outcome,
            FixOutcome::Failed(FixFailure::Parse(_))
        ));
        assert_eq!(report.final_text, "a # b");
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics.as_slice()[0].rule_id, "parse-error");
        assert_eq!(report.diagnostics.as_slice()[0].span, Span::new(2, 3));
        assert!(report.history.is_empty());
    }

    #[test]
    fn test_cancelled_run_keeps_source() {
        let set = active(vec![Arc::new(Grow)]);
        let token = CancellationToken::new();
        token.cancel();

        let report = FixEngine::new(&WordParser, &set)
            .with_cancellation(token)
            .fix("a", Path::new("doc.txt"));

        assert_eq!(report.outcome, FixOutcome::Cancelled);
        assert_eq!(report.final_text, "a");
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_malformed_fix_is_reported_without_fix() {
        let report = fix(vec![Arc::new(Malformed)], "ab");

        assert_eq!(report.outcome, FixOutcome::Converged);
        assert_eq!(report.final_text, "ab");
        assert_eq!(report.diagnostics.len(), 1);
        assert!(!report.diagnostics.as_slice()[0].has_fix());
        assert_eq!(report.malformed.len(), 1);
    }

    #[test]
    fn test_check_never_applies() {
        let set = active(vec![Arc::new(Grow)]);
        let eval = FixEngine::new(&WordParser, &set)
            .check("a", Path::new("doc.txt"))
            .unwrap();
        assert_eq!(eval.diagnostics.len(), 1);
        assert_eq!(eval.diagnostics.fixable_count(), 1);
    }

    #[test]
    fn test_fix_is_idempotent() {
        let rules: Vec<Arc<dyn Rule>> = vec![
            Arc::new(Upper),
            Arc::new(Rename {
                id: "a-rename",
                from: "foo",
                to: "bar",
            }),
        ];
        let first = fix(rules.clone(), "foo qux foo");
        assert!(first.outcome.is_converged());

        let second = fix(rules, &first.final_text);
        assert!(second.outcome.is_converged());
        assert_eq!(second.passes, 1);
        assert_eq!(second.diagnostics.fixable_count(), 0);
        assert_eq!(second.final_text, first.final_text);
    }
}
