//! Diagnostic types for linting results

use crate::span::{DocumentVersion, Span};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Severity level for diagnostics
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,
    /// Warning - potential issue
    #[default]
    Warning,
    /// Error - definite problem
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" | "hint" | "note" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            _ => Err(()),
        }
    }
}

/// A single span replacement against one source version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edit {
    /// Span in the pre-edit source
    pub span: Span,
    /// Replacement text (empty for a deletion)
    pub replacement: String,
}

impl Edit {
    pub fn replace(span: Span, replacement: &str) -> Self {
        Self {
            span,
            replacement: replacement.to_string(),
        }
    }

    pub fn insert(offset: usize, text: &str) -> Self {
        Self::replace(Span::empty(offset), text)
    }

    pub fn delete(span: Span) -> Self {
        Self::replace(span, "")
    }

    pub fn is_insertion(&self) -> bool {
        self.span.is_empty()
    }

    /// Change in document length when this edit is applied
    pub fn delta(&self) -> isize {
        self.replacement.len() as isize - self.span.len() as isize
    }
}

/// A suggested fix: edits that must be applied together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    /// Description of the fix
    #[serde(default)]
    pub description: Option<String>,
    /// Edits, sorted by start and mutually non-overlapping
    pub edits: Vec<Edit>,
}

impl Fix {
    pub fn new(edits: Vec<Edit>) -> Self {
        Self {
            description: None,
            edits,
        }
    }

    pub fn single(edit: Edit) -> Self {
        Self::new(vec![edit])
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// A lint diagnostic (warning, error, etc.)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Rule ID that triggered this diagnostic
    pub rule_id: String,
    /// Severity level
    pub severity: Severity,
    /// Offending region
    pub span: Span,
    /// Human-readable message
    pub message: String,
    /// Suggested fix
    #[serde(default)]
    pub fix: Option<Fix>,
    /// Help text (usually rule description)
    #[serde(default)]
    pub help: Option<String>,
    /// Source version the span refers to
    #[serde(default)]
    pub version: DocumentVersion,
}

impl Diagnostic {
    /// Create a new diagnostic
    pub fn new(rule_id: &str, severity: Severity, span: Span, message: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            severity,
            span,
            message: message.to_string(),
            fix: None,
            help: None,
            version: DocumentVersion::default(),
        }
    }

    /// Add a suggested fix
    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }

    /// Add a single-edit fix
    pub fn with_edit(self, edit: Edit) -> Self {
        self.with_fix(Fix::single(edit))
    }

    /// Add help text
    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }

    pub fn with_version(mut self, version: DocumentVersion) -> Self {
        self.version = version;
        self
    }

    /// Drop the fix, keeping the report
    pub fn without_fix(mut self) -> Self {
        self.fix = None;
        self
    }

    /// Check if this diagnostic has a fix
    pub fn has_fix(&self) -> bool {
        self.fix.as_ref().is_some_and(|f| !f.edits.is_empty())
    }

    /// Check if this is an error
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Check if this is a warning
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

/// Diagnostics of one pass in report order
///
/// Sorted by `(span.start, span.end, rule_id)` with duplicates (same rule,
/// span and message) collapsed. The order drives both reports and fix
/// conflict resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSet {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSet {
    /// Sort and deduplicate raw rule output
    pub fn normalize(mut diagnostics: Vec<Diagnostic>) -> Self {
        diagnostics.sort_by(|a, b| {
            (a.span.start, a.span.end, &a.rule_id).cmp(&(b.span.start, b.span.end, &b.rule_id))
        });

        let mut seen = HashSet::new();
        diagnostics.retain(|d| seen.insert((d.rule_id.clone(), d.span, d.message.clone())));

        Self { diagnostics }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Diagnostics carrying a fix
    pub fn fixable(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.has_fix())
    }

    pub fn fixable_count(&self) -> usize {
        self.fixable().count()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == severity).count()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Diagnostics reported by one rule
    pub fn by_rule<'a>(&'a self, rule_id: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.diagnostics.iter().filter(move |d| d.rule_id == rule_id)
    }
}

impl IntoIterator for DiagnosticSet {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

impl<'a> IntoIterator for &'a DiagnosticSet {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.iter()
    }
}
