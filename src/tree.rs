//! Structural document model and the parser contract
//!
//! Parsers turn raw text into a tree of generic [`Node`]s. The engine never
//! looks at grammar-specific types: rules inspect node kinds, spans and
//! attributes only.

use crate::diagnostic::{Diagnostic, Severity};
use crate::span::{DocumentVersion, SourceText, Span};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

/// Attribute key under which parsers surface inline suppression markers
pub const SUPPRESS_ATTR: &str = "suppress";

/// Attribute key holding a node's identifier (element name, property key, ...)
pub const NAME_ATTR: &str = "name";

/// Rule id of the diagnostic standing in for an unparsable document
pub const PARSE_ERROR_RULE: &str = "parse-error";

/// A document could not be structurally modeled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at {span}: {message}")]
pub struct ParseFailure {
    pub span: Span,
    pub message: String,
}

impl ParseFailure {
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }

    /// The single error reported for a document that failed to parse
    pub fn to_diagnostic(&self, source: &SourceText) -> Diagnostic {
        let end = self.span.end.min(source.len());
        let span = Span::new(self.span.start.min(end), end);
        let (line, column) = source.line_col(span.start);
        Diagnostic::new(
            PARSE_ERROR_RULE,
            Severity::Error,
            span,
            &format!("{}:{}: {}", line, column, self.message),
        )
        .with_version(source.version)
    }
}

/// A node in the parsed document tree
///
/// Nodes are built bottom-up by a parser and are immutable once wrapped in a
/// [`Tree`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    kind: String,
    span: Span,
    children: Vec<Node>,
    attributes: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(kind: &str, span: Span) -> Self {
        Self {
            kind: kind.to_string(),
            span,
            children: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set an attribute
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Append a child (children must be added in source order)
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Mark this node as suppressing the given rules (empty = all rules)
    pub fn with_suppression(self, rule_ids: &[&str]) -> Self {
        let ids: Vec<Value> = rule_ids.iter().map(|id| Value::from(*id)).collect();
        self.with_attr(SUPPRESS_ATTR, Value::Array(ids))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Look up a dotted path through nested attribute maps (`fields.Version`)
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.attributes.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// String attribute at a dotted path
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    /// The node's `name` attribute
    pub fn name(&self) -> Option<&str> {
        self.get_str(NAME_ATTR)
    }

    /// Source text covered by this node
    pub fn text<'a>(&self, source: &'a str) -> Option<&'a str> {
        self.span.slice(source)
    }

    /// Inline suppression marker carried by this node, if any
    pub fn suppression(&self) -> Option<Suppression> {
        self.attributes.get(SUPPRESS_ATTR).and_then(Suppression::from_value)
    }

    /// Pre-order traversal of this node and its descendants
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants { stack: vec![self] }
    }
}

/// Depth-first, source-order iterator over a subtree
pub struct Descendants<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Rules silenced by a node-level marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    All,
    Rules(BTreeSet<String>),
}

impl Suppression {
    /// Interpret a `suppress` attribute value
    ///
    /// `true`, `"all"`, `"*"` and an empty list silence every rule; a string or
    /// list of strings names individual rules.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(true) => Some(Suppression::All),
            Value::String(s) if s == "all" || s == "*" => Some(Suppression::All),
            Value::String(s) => Some(Suppression::Rules(BTreeSet::from([s.clone()]))),
            Value::Array(items) => {
                let ids: BTreeSet<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect();
                if ids.is_empty() || ids.contains("all") || ids.contains("*") {
                    Some(Suppression::All)
                } else {
                    Some(Suppression::Rules(ids))
                }
            }
            _ => None,
        }
    }

    pub fn covers(&self, rule_id: &str) -> bool {
        match self {
            Suppression::All => true,
            Suppression::Rules(ids) => ids.contains(rule_id),
        }
    }
}

/// A parsed document, valid for exactly one source version
#[derive(Debug, Clone)]
pub struct Tree {
    root: Node,
    version: DocumentVersion,
    source_len: usize,
}

impl Tree {
    /// Wrap a parser's root node, checking the structural invariants
    pub fn new(root: Node, source: &SourceText) -> Result<Self, ParseFailure> {
        check_node(&root, source.len())?;
        Ok(Self {
            root,
            version: source.version,
            source_len: source.len(),
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn version(&self) -> DocumentVersion {
        self.version
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Iterate over all nodes (pre-order)
    pub fn iter(&self) -> Descendants<'_> {
        self.root.descendants()
    }

    /// Nodes of a given kind, in source order
    pub fn nodes_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.iter().filter(move |n| n.kind() == kind)
    }

    /// Every suppression marker with the span it covers
    pub fn suppressions(&self) -> Vec<(Span, Suppression)> {
        self.iter()
            .filter_map(|n| n.suppression().map(|s| (n.span(), s)))
            .collect()
    }
}

fn check_node(node: &Node, source_len: usize) -> Result<(), ParseFailure> {
    let span = node.span;
    if !span.is_well_formed() || span.end > source_len {
        return Err(ParseFailure::new(
            span,
            format!("{} node span {} is outside the source", node.kind, span),
        ));
    }

    let mut prev_end = span.start;
    for child in &node.children {
        if !span.contains(child.span) {
            return Err(ParseFailure::new(
                child.span,
                format!(
                    "{} node {} escapes its parent {} {}",
                    child.kind, child.span, node.kind, span
                ),
            ));
        }
        if child.span.start < prev_end {
            return Err(ParseFailure::new(
                child.span,
                format!("{} node {} overlaps a preceding sibling", child.kind, child.span),
            ));
        }
        prev_end = child.span.end;
        check_node(child, source_len)?;
    }

    Ok(())
}

/// Parser trait for format-specific structural modeling
pub trait Parser: Send + Sync {
    /// Parser identifier (e.g., "xml", "php", "openapi")
    fn id(&self) -> &str;

    /// File extensions this parser handles (without dot)
    fn extensions(&self) -> &[&str];

    /// Parse text into a root node. Must be deterministic.
    fn parse(&self, text: &str, path: &Path) -> Result<Node, ParseFailure>;
}

/// Parse one source version into a validated tree
pub fn parse_tree(
    parser: &dyn Parser,
    source: &SourceText,
    path: &Path,
) -> Result<Tree, ParseFailure> {
    let root = parser.parse(&source.text, path)?;
    Tree::new(root, source)
}
