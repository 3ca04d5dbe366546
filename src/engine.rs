//! Linter: configuration, parsers and rules wired into check and fix runs

use crate::config::{CompiledPathFilter, Config, ConfigError};
use crate::diagnostic::{DiagnosticSet, Severity};
use crate::evaluate::{merge_timings, Evaluation, RuleTiming};
use crate::fixer::{CancellationToken, FixEngine, FixReport};
use crate::registry::{ActiveRuleSet, RuleRegistry};
use crate::span::SourceText;
use crate::tree::{Parser, PARSE_ERROR_RULE};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A document could not be processed
#[derive(Debug, Error)]
pub enum LintError {
    #[error("no parser registered for {0}")]
    NoParser(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Input document for batch runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// Outcome for one document of a batch
#[derive(Debug)]
pub struct DocumentReport<T> {
    pub path: PathBuf,
    pub result: Result<T, LintError>,
}

/// Outcome of a batch, in input order
#[derive(Debug)]
pub struct BatchReport<T> {
    pub documents: Vec<DocumentReport<T>>,
    pub summary: RunSummary,
}

/// Counts across a batch run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Documents processed
    pub documents: usize,

    /// Documents that could not be processed
    pub failed: usize,

    /// Documents with errors
    pub documents_with_errors: usize,

    /// Documents with warnings
    pub documents_with_warnings: usize,

    /// Total errors
    pub error_count: usize,

    /// Total warnings
    pub warning_count: usize,

    /// Total info messages
    pub info_count: usize,

    /// Documents whose text was changed by fixes
    pub fixed: usize,

    /// Fix runs that stopped without converging
    pub capped: usize,

    /// Processing duration
    pub duration: Duration,

    /// Per-rule timing statistics (rule_id -> timing)
    pub rule_timings: HashMap<String, RuleTiming>,
}

impl RunSummary {
    /// Check if there are any errors
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Check if any document failed to process
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Check if there are any warnings
    pub fn has_warnings(&self) -> bool {
        self.warning_count > 0
    }

    /// No errors, no warnings, no failures
    pub fn is_clean(&self) -> bool {
        self.error_count == 0 && self.warning_count == 0 && self.failed == 0
    }

    /// Count one document's diagnostics
    pub fn record(&mut self, diagnostics: &DiagnosticSet) {
        let errors = diagnostics.count(Severity::Error);
        let warnings = diagnostics.count(Severity::Warning);

        self.documents += 1;
        self.error_count += errors;
        self.warning_count += warnings;
        self.info_count += diagnostics.count(Severity::Info);
        if errors > 0 {
            self.documents_with_errors += 1;
        }
        if warnings > 0 {
            self.documents_with_warnings += 1;
        }
    }

    /// Count a document's diagnostics after a parse failure or failed fix
    pub fn record_failed(&mut self, diagnostics: &DiagnosticSet) {
        self.record(diagnostics);
        self.failed += 1;
    }

    /// Count a document that could not be processed at all
    pub fn record_failure(&mut self) {
        self.documents += 1;
        self.failed += 1;
    }

    /// Get rule timings sorted by total time (descending)
    pub fn sorted_timings(&self) -> Vec<&RuleTiming> {
        let mut timings: Vec<_> = self.rule_timings.values().collect();
        timings.sort_by(|a, b| {
            b.total_time
                .cmp(&a.total_time)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        timings
    }

    /// Format timing statistics as a string
    pub fn format_timings(&self) -> String {
        let timings = self.sorted_timings();
        if timings.is_empty() {
            return "No timing data available".to_string();
        }

        let mut output = String::new();
        output.push_str("Rule Timing Statistics:\n");
        output.push_str(&format!(
            "{:<40} {:>12} {:>12} {:>10} {:>12}\n",
            "Rule ID", "Total", "Avg", "Evals", "Matches"
        ));
        output.push_str(&"-".repeat(90));
        output.push('\n');

        for timing in timings {
            let total_ms = timing.total_time.as_secs_f64() * 1000.0;
            let avg_us = timing.avg_time().as_secs_f64() * 1_000_000.0;

            output.push_str(&format!(
                "{:<40} {:>10.2}ms {:>10.2}µs {:>10} {:>12}\n",
                timing.rule_id, total_ms, avg_us, timing.evaluation_count, timing.match_count
            ));
        }

        output
    }
}

/// The main linter
///
/// Holds a validated configuration, the rule registry and the parsers keyed
/// by file extension. Documents share nothing mutable, so batch runs fan out
/// over a rayon pool with one fix engine per document.
pub struct Linter {
    config: Config,
    files: CompiledPathFilter,
    registry: RuleRegistry,
    parsers: HashMap<String, Arc<dyn Parser>>,
    cancel: CancellationToken,
}

impl Linter {
    /// Validate `config` against `registry`
    ///
    /// Unknown rule ids, bad severity tokens, invalid options and bad globs
    /// are all rejected here, before any document is looked at.
    pub fn new(config: Config, registry: RuleRegistry) -> Result<Self, ConfigError> {
        registry.validate(&config)?;
        let files = config.files.compile()?;

        log::debug!(
            "linter ready: {} rules registered, {} overrides",
            registry.len(),
            config.overrides.len()
        );

        Ok(Self {
            config,
            files,
            registry,
            parsers: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Register a parser for each extension it claims
    pub fn register_parser(&mut self, parser: Arc<dyn Parser>) {
        for ext in parser.extensions() {
            self.parsers.insert(ext.to_string(), Arc::clone(&parser));
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.register_parser(parser);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Token shared with every fix run started by this linter
    ///
    /// The token lives as long as the linter. Cancelling it stops the runs
    /// in flight and every later one until [`CancellationToken::reset`] is
    /// called, so reset it before starting the next batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rules that apply to `path`
    pub fn resolve(&self, path: &Path) -> Result<ActiveRuleSet, ConfigError> {
        self.registry.resolve(&self.config, path)
    }

    /// Whether the global file filter selects `path`
    pub fn is_selected(&self, path: &Path) -> bool {
        self.files.is_match(path)
    }

    fn parser_for(&self, path: &Path) -> Result<&dyn Parser, LintError> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.parsers.get(ext))
            .map(|parser| parser.as_ref())
            .ok_or_else(|| LintError::NoParser(path.to_path_buf()))
    }

    fn fix_engine<'a>(&self, parser: &'a dyn Parser, active: &'a ActiveRuleSet) -> FixEngine<'a> {
        FixEngine::new(parser, active)
            .with_max_passes(self.config.engine.max_passes)
            .with_parallel_rules(self.config.engine.parallel_rules)
            .with_cancellation(self.cancel.clone())
    }

    /// Parse and evaluate one document; nothing is applied
    ///
    /// A document that fails to parse yields a single `parse-error`
    /// diagnostic and no rule runs against it.
    pub fn check(&self, text: &str, path: &Path) -> Result<DiagnosticSet, LintError> {
        Ok(self.evaluate(text, path)?.diagnostics)
    }

    fn evaluate(&self, text: &str, path: &Path) -> Result<Evaluation, LintError> {
        if !self.is_selected(path) {
            log::debug!("{} excluded by file filter", path.display());
            return Ok(Evaluation::default());
        }

        let active = self.resolve(path)?;
        let parser = self.parser_for(path)?;
        match self.fix_engine(parser, &active).check(text, path) {
            Ok(eval) => Ok(eval),
            Err(failure) => {
                log::debug!("{}: {}", path.display(), failure);
                Ok(Evaluation {
                    diagnostics: DiagnosticSet::normalize(vec![
                        failure.to_diagnostic(&SourceText::new(text))
                    ]),
                    ..Evaluation::default()
                })
            }
        }
    }

    /// Run the fix loop on one document
    ///
    /// Parse failures are reported through the returned outcome; only a
    /// missing parser or a configuration problem is an error here.
    pub fn fix(&self, text: &str, path: &Path) -> Result<FixReport, LintError> {
        if !self.is_selected(path) {
            log::debug!("{} excluded by file filter", path.display());
            return Ok(FixReport::unchanged(text));
        }

        let active = self.resolve(path)?;
        let parser = self.parser_for(path)?;
        Ok(self.fix_engine(parser, &active).fix(text, path))
    }

    /// Check many documents in parallel
    pub fn check_all(&self, documents: &[Document]) -> BatchReport<DiagnosticSet> {
        let start = Instant::now();
        let results = self.run_batch(documents, |doc| self.evaluate(&doc.text, &doc.path));

        let mut summary = RunSummary::default();
        let documents = results
            .into_iter()
            .map(|(path, result)| match result {
                Ok(eval) => {
                    if eval.diagnostics.by_rule(PARSE_ERROR_RULE).next().is_some() {
                        log::warn!("{}: could not be parsed", path.display());
                        summary.record_failed(&eval.diagnostics);
                    } else {
                        summary.record(&eval.diagnostics);
                    }
                    merge_timings(&mut summary.rule_timings, &eval.timings);
                    DocumentReport {
                        path,
                        result: Ok(eval.diagnostics),
                    }
                }
                Err(e) => {
                    log::warn!("{}: {}", path.display(), e);
                    summary.record_failure();
                    DocumentReport {
                        path,
                        result: Err(e),
                    }
                }
            })
            .collect();

        summary.duration = start.elapsed();
        BatchReport { documents, summary }
    }

    /// Fix many documents in parallel
    pub fn fix_all(&self, documents: &[Document]) -> BatchReport<FixReport> {
        let start = Instant::now();
        let results = self.run_batch(documents, |doc| self.fix(&doc.text, &doc.path));

        let mut summary = RunSummary::default();
        for (path, result) in &results {
            match result {
                Ok(report) if report.outcome.is_failed() => {
                    log::warn!("{}: {}", path.display(), report.outcome);
                    summary.record_failed(&report.diagnostics);
                }
                Ok(report) => {
                    summary.record(&report.diagnostics);
                    merge_timings(&mut summary.rule_timings, &report.timings);
                    if report.changed() {
                        summary.fixed += 1;
                    }
                    if report.outcome.is_capped() {
                        summary.capped += 1;
                    }
                }
                Err(e) => {
                    log::warn!("{}: {}", path.display(), e);
                    summary.record_failure();
                }
            }
        }

        summary.duration = start.elapsed();
        BatchReport {
            documents: results
                .into_iter()
                .map(|(path, result)| DocumentReport { path, result })
                .collect(),
            summary,
        }
    }

    fn run_batch<T, F>(&self, documents: &[Document], run: F) -> Vec<(PathBuf, Result<T, LintError>)>
    where
        T: Send,
        F: Fn(&Document) -> Result<T, LintError> + Sync,
    {
        let process = |doc: &Document| (doc.path.clone(), run(doc));

        if !self.config.engine.parallel {
            return documents.iter().map(process).collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_count())
            .build()
        {
            Ok(pool) => pool.install(|| documents.par_iter().map(process).collect()),
            Err(e) => {
                log::warn!("could not start worker pool, running sequentially: {}", e);
                documents.iter().map(process).collect()
            }
        }
    }
}
