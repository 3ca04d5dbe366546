//! Style checks: required flags, token rewrites, trailing delimiters

use super::{insert_offset, render, value_string, NodeCheck};
use crate::diagnostic::{Diagnostic, Edit, Fix};
use crate::rule::RuleContext;
use crate::span::Span;
use crate::tree::Node;
use serde::Deserialize;
use serde_json::Value;

/// A node attribute must hold an expected value (a type hint is present, a
/// flag is set)
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredFlag {
    /// Dotted attribute path
    pub attribute: String,

    #[serde(default = "default_expected")]
    pub expected: Value,

    /// Text inserted at the node's `insertAt` offset by the fix
    #[serde(default)]
    pub insert: Option<String>,
}

fn default_expected() -> Value {
    Value::Bool(true)
}

impl RequiredFlag {
    pub fn new(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            expected: default_expected(),
            insert: None,
        }
    }

    pub fn with_insert(mut self, text: &str) -> Self {
        self.insert = Some(text.to_string());
        self
    }
}

impl NodeCheck for RequiredFlag {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        if node.get_path(&self.attribute) == Some(&self.expected) {
            return None;
        }

        let expected = value_string(&self.expected);
        let extra = [
            ("attribute", self.attribute.as_str()),
            ("expected", expected.as_str()),
        ];
        let text = render(
            message,
            "{kind} '{name}' should have {attribute} = {expected}",
            node,
            &extra,
        );
        let diag = ctx.report(node.span(), &text);

        match (&self.insert, insert_offset(node)) {
            (Some(insert), Some(offset)) => {
                let inserted = super::format_message(insert, node, &extra);
                Some(diag.with_edit(Edit::insert(offset, &inserted)))
            }
            _ => Some(diag),
        }
    }

    fn can_fix(&self) -> bool {
        self.insert.is_some()
    }
}

/// How a token rule compares node text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenMatch {
    /// Whole node text
    #[default]
    Exact,
    /// Leading text of the node
    Prefix,
}

/// Rewrite a token (`==` to `===`, `array(` to `[`)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenReplace {
    pub from: String,
    pub to: String,
    #[serde(default, rename = "match")]
    pub mode: TokenMatch,
}

impl TokenReplace {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            mode: TokenMatch::Exact,
        }
    }

    pub fn prefix(mut self) -> Self {
        self.mode = TokenMatch::Prefix;
        self
    }

    fn matched_span(&self, text: &str, span: Span) -> Option<Span> {
        match self.mode {
            TokenMatch::Exact if text == self.from => Some(span),
            TokenMatch::Prefix if text.starts_with(&self.from) => {
                Some(Span::new(span.start, span.start + self.from.len()))
            }
            _ => None,
        }
    }
}

impl NodeCheck for TokenReplace {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        let text = node.text(ctx.source)?;
        let span = self.matched_span(text, node.span())?;

        let extra = [("from", self.from.as_str()), ("to", self.to.as_str())];
        let message = render(message, "use '{to}' instead of '{from}'", node, &extra);
        Some(
            ctx.report(span, &message).with_fix(
                Fix::single(Edit::replace(span, &self.to))
                    .with_description(&format!("Replace '{}' with '{}'", self.from, self.to)),
            ),
        )
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<(), String> {
        if self.from.is_empty() {
            return Err("'from' is empty".to_string());
        }
        if self.mode == TokenMatch::Prefix && self.to.starts_with(&self.from) {
            // the rewrite would match again on every pass
            return Err(format!("'{}' starts with '{}'", self.to, self.from));
        }
        if self.mode == TokenMatch::Exact && self.from == self.to {
            return Err(format!("'{}' is replaced with itself", self.from));
        }
        Ok(())
    }
}

/// The last child of a list must be followed by a delimiter (trailing commas)
#[derive(Debug, Clone, Deserialize)]
pub struct TrailingDelimiter {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Only children of this kind count as items
    #[serde(default)]
    pub child_kind: Option<String>,

    /// Only lists spanning several lines need the delimiter
    #[serde(default = "default_true")]
    pub multiline_only: bool,
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

impl TrailingDelimiter {
    pub fn new(delimiter: &str) -> Self {
        Self {
            delimiter: delimiter.to_string(),
            child_kind: None,
            multiline_only: true,
        }
    }

    pub fn with_child_kind(mut self, kind: &str) -> Self {
        self.child_kind = Some(kind.to_string());
        self
    }
}

impl NodeCheck for TrailingDelimiter {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        let last = node
            .children()
            .iter()
            .filter(|c| self.child_kind.as_deref().is_none_or(|k| c.kind() == k))
            .last()?;

        let tail = ctx.text(Span::new(last.span().end, node.span().end))?;
        if tail.trim_start().starts_with(&self.delimiter) {
            return None;
        }
        if self.multiline_only && !ctx.text(node.span())?.contains('\n') {
            return None;
        }

        let extra = [("delimiter", self.delimiter.as_str())];
        let text = render(message, "missing trailing '{delimiter}'", node, &extra);
        let at = last.span().end;
        Some(
            ctx.report(Span::empty(at), &text)
                .with_edit(Edit::insert(at, &self.delimiter)),
        )
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<(), String> {
        if self.delimiter.is_empty() {
            return Err("delimiter is empty".to_string());
        }
        Ok(())
    }
}
