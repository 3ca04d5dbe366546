//! Rule definition and evaluation context

use crate::diagnostic::{Diagnostic, Severity};
use crate::span::Span;
use crate::tree::Tree;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// A unit of policy evaluated against one parsed document
///
/// Rules must be pure: the same tree, source and options always produce the
/// same diagnostics. The fix engine's convergence and parallel evaluation both
/// depend on it.
pub trait Rule: Send + Sync {
    /// Stable rule identifier (e.g., "schema-required-type")
    fn id(&self) -> &str;

    /// Severity used when configuration does not override it
    fn default_severity(&self) -> Severity {
        Severity::Warning
    }

    /// Whether the rule runs when configuration does not mention it
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// Whether diagnostics from this rule carry fixes
    fn can_fix(&self) -> bool {
        false
    }

    /// Detailed description, attached to diagnostics as help text
    fn description(&self) -> Option<&str> {
        None
    }

    /// Check the opaque options block from configuration
    fn validate_options(&self, _options: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Inspect the tree and report violations
    fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic>;
}

/// Everything a rule may look at during one evaluation
pub struct RuleContext<'a> {
    pub tree: &'a Tree,
    pub source: &'a str,
    pub path: &'a Path,
    rule_id: &'a str,
    severity: Severity,
    options: &'a Value,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        tree: &'a Tree,
        source: &'a str,
        path: &'a Path,
        rule_id: &'a str,
        severity: Severity,
        options: &'a Value,
    ) -> Self {
        Self {
            tree,
            source,
            path,
            rule_id,
            severity,
            options,
        }
    }

    /// Resolved severity for this run
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Per-rule options from configuration (`Value::Null` when absent)
    pub fn options(&self) -> &Value {
        self.options
    }

    /// Source text under a span
    pub fn text(&self, span: Span) -> Option<&'a str> {
        span.slice(self.source)
    }

    /// Start a diagnostic stamped with this rule's id, severity and version
    pub fn report(&self, span: Span, message: &str) -> Diagnostic {
        Diagnostic::new(self.rule_id, self.severity, span, message).with_version(self.tree.version())
    }
}

/// Deserialize a rule's options block, treating `null` as the defaults
pub fn parse_options<T: DeserializeOwned + Default>(options: &Value) -> Result<T, String> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| e.to_string())
}
