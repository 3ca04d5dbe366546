//! Data-driven rule families
//!
//! Rules are declared in YAML or JSON rule files and look at documents only
//! through node kinds and attributes. A definition has common metadata
//! (`id`, `severity`, `target`, ...) and a family-specific check selected by
//! its `kind` tag:
//!
//! ```yaml
//! rules:
//!   - id: component-requires-guid
//!     kind: required-field
//!     target: { kind: element, name: Component }
//!     field: Guid
//!     default: "*"
//! ```
//!
//! Parsers expose keyed values of a node under the `fields` attribute, one
//! `attribute` child node per field whose span covers the value text, and an
//! `insertAt` offset where new fields may be inserted.

pub mod condition;
pub mod schema;
pub mod style;

pub use condition::{Condition, ConditionCheck, ConditionFix};
pub use schema::{AllowedValues, Case, NamingCase, RequiredField, ValueRange};
pub use style::{RequiredFlag, TokenMatch, TokenReplace, TrailingDelimiter};

use crate::config::ConfigError;
use crate::diagnostic::{Diagnostic, Severity};
use crate::registry::RuleRegistry;
use crate::rule::{Rule, RuleContext};
use crate::span::Span;
use crate::tree::Node;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Attribute holding a node's keyed values
pub const FIELDS_ATTR: &str = "fields";

/// Attribute holding the byte offset where a new field may be inserted
pub const INSERT_AT_ATTR: &str = "insertAt";

/// Node kind of per-field child nodes
pub const FIELD_KIND: &str = "attribute";

/// Errors loading rule definitions
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to parse rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse rule file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Rule '{rule_id}': {message}")]
    Invalid { rule_id: String, message: String },

    #[error(transparent)]
    Registry(#[from] ConfigError),
}

impl DefinitionError {
    fn invalid(rule_id: &str, message: impl Into<String>) -> Self {
        DefinitionError::Invalid {
            rule_id: rule_id.to_string(),
            message: message.into(),
        }
    }
}

/// Name pattern with `*` and `?` wildcards
#[derive(Debug, Clone)]
pub enum NamePattern {
    Exact(String),
    Wildcard(Regex),
}

impl NamePattern {
    pub fn is_match(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(expected) => expected == name,
            NamePattern::Wildcard(re) => re.is_match(name),
        }
    }
}

impl TryFrom<String> for NamePattern {
    type Error = regex::Error;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        if !pattern.contains(['*', '?']) {
            return Ok(NamePattern::Exact(pattern));
        }
        let escaped = regex::escape(&pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        Ok(NamePattern::Wildcard(Regex::new(&format!("^{}$", escaped))?))
    }
}

impl<'de> Deserialize<'de> for NamePattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        NamePattern::try_from(pattern).map_err(serde::de::Error::custom)
    }
}

/// Which nodes a rule looks at
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Target {
    /// Node kind (e.g., "element", "function")
    pub kind: Option<String>,

    /// Node name pattern (e.g., "Package", "Component*")
    pub name: Option<NamePattern>,
}

impl Target {
    pub fn kind(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            name: None,
        }
    }

    pub fn with_name(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.name = Some(NamePattern::try_from(pattern.to_string())?);
        Ok(self)
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(kind) = &self.kind {
            if node.kind() != kind {
                return false;
            }
        }
        match &self.name {
            Some(pattern) => node.name().is_some_and(|name| pattern.is_match(name)),
            None => true,
        }
    }
}

/// Metadata shared by every rule family
#[derive(Debug, Clone, Deserialize)]
pub struct RuleMeta {
    /// Unique rule identifier
    pub id: String,

    /// Detailed description
    #[serde(default)]
    pub description: Option<String>,

    /// Default severity level
    #[serde(default)]
    pub severity: Severity,

    /// Whether this rule is enabled by default
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Nodes the rule applies to
    #[serde(default)]
    pub target: Target,

    /// Message template overriding the family's default message
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RuleMeta {
    pub fn new(id: &str, target: Target) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            severity: Severity::default(),
            enabled: true,
            target,
            message: None,
        }
    }
}

/// Family-specific part of a rule, run once per targeted node
pub trait NodeCheck: Send + Sync {
    /// Report at most one violation for `node`
    fn check(&self, ctx: &RuleContext<'_>, node: &Node, message: Option<&str>)
        -> Option<Diagnostic>;

    fn can_fix(&self) -> bool {
        false
    }

    fn validate_options(&self, _options: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Reject definitions that cannot work
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A declared rule: metadata plus one family check
#[derive(Debug, Clone, Deserialize)]
pub struct Defined<T> {
    #[serde(flatten)]
    pub meta: RuleMeta,
    #[serde(flatten)]
    pub check: T,
}

impl<T> Defined<T> {
    pub fn new(meta: RuleMeta, check: T) -> Self {
        Self { meta, check }
    }
}

impl<T: NodeCheck> Rule for Defined<T> {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn default_severity(&self) -> Severity {
        self.meta.severity
    }

    fn enabled_by_default(&self) -> bool {
        self.meta.enabled
    }

    fn can_fix(&self) -> bool {
        self.check.can_fix()
    }

    fn description(&self) -> Option<&str> {
        self.meta.description.as_deref()
    }

    fn validate_options(&self, options: &Value) -> Result<(), String> {
        self.check.validate_options(options)
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Vec<Diagnostic> {
        let message = self.meta.message.as_deref();
        ctx.tree
            .iter()
            .filter(|node| self.meta.target.matches(node))
            .filter_map(|node| self.check.check(ctx, node, message))
            .collect()
    }
}

/// One entry of a rule file
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RuleDefinition {
    RequiredField(Defined<RequiredField>),
    AllowedValues(Defined<AllowedValues>),
    ValueRange(Defined<ValueRange>),
    NamingCase(Defined<NamingCase>),
    RequiredFlag(Defined<RequiredFlag>),
    TokenReplace(Defined<TokenReplace>),
    TrailingDelimiter(Defined<TrailingDelimiter>),
    Condition(Defined<ConditionCheck>),
}

impl RuleDefinition {
    pub fn id(&self) -> &str {
        match self {
            RuleDefinition::RequiredField(d) => &d.meta.id,
            RuleDefinition::AllowedValues(d) => &d.meta.id,
            RuleDefinition::ValueRange(d) => &d.meta.id,
            RuleDefinition::NamingCase(d) => &d.meta.id,
            RuleDefinition::RequiredFlag(d) => &d.meta.id,
            RuleDefinition::TokenReplace(d) => &d.meta.id,
            RuleDefinition::TrailingDelimiter(d) => &d.meta.id,
            RuleDefinition::Condition(d) => &d.meta.id,
        }
    }

    /// Validate the definition and turn it into a registrable rule
    pub fn into_rule(self) -> Result<Arc<dyn Rule>, DefinitionError> {
        if self.id().trim().is_empty() {
            return Err(DefinitionError::invalid(self.id(), "rule id is empty"));
        }

        match self {
            RuleDefinition::RequiredField(d) => checked(d),
            RuleDefinition::AllowedValues(d) => checked(d),
            RuleDefinition::ValueRange(d) => checked(d),
            RuleDefinition::NamingCase(d) => checked(d),
            RuleDefinition::RequiredFlag(d) => checked(d),
            RuleDefinition::TokenReplace(d) => checked(d),
            RuleDefinition::TrailingDelimiter(d) => checked(d),
            RuleDefinition::Condition(d) => checked(d),
        }
    }
}

fn checked<T: NodeCheck + 'static>(defined: Defined<T>) -> Result<Arc<dyn Rule>, DefinitionError> {
    defined
        .check
        .validate()
        .map_err(|message| DefinitionError::invalid(&defined.meta.id, message))?;
    Ok(Arc::new(defined))
}

/// Rule file format (for loading from YAML/JSON)
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    /// File format version
    #[serde(default)]
    pub version: Option<String>,

    /// Rules defined in this file
    pub rules: Vec<RuleDefinition>,
}

impl RuleFile {
    pub fn from_yaml_str(content: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(content)?)
    }
}

impl RuleRegistry {
    /// Register every rule of a rule file, returning how many were added
    pub fn register_definitions(&mut self, file: RuleFile) -> Result<usize, DefinitionError> {
        let count = file.rules.len();
        for definition in file.rules {
            let rule = definition.into_rule()?;
            log::trace!("registering declared rule {}", rule.id());
            self.register(rule)?;
        }
        Ok(count)
    }
}

/// Keyed value of a node (`fields.<name>`)
pub fn field_value<'a>(node: &'a Node, field: &str) -> Option<&'a Value> {
    node.get(FIELDS_ATTR)?.get(field)
}

/// Span of a field's value text, if the parser exposed one
pub fn field_span(node: &Node, field: &str) -> Option<Span> {
    node.children()
        .iter()
        .find(|child| child.kind() == FIELD_KIND && child.name() == Some(field))
        .map(|child| child.span())
}

/// Offset where a new field may be inserted
pub fn insert_offset(node: &Node) -> Option<usize> {
    node.get(INSERT_AT_ATTR)?
        .as_u64()
        .and_then(|offset| usize::try_from(offset).ok())
}

/// Render a JSON value the way it reads in a message
pub fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fill `{placeholder}` slots of a message template
///
/// `{name}` and `{kind}` come from the node, other placeholders are looked up
/// first in `extra`, then as a dotted attribute path. Unknown placeholders
/// render as `(unknown)`.
pub fn format_message(template: &str, node: &Node, extra: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = &after[..close];
        let value = match key {
            "name" => node.name().unwrap_or("(unknown)").to_string(),
            "kind" => node.kind().to_string(),
            _ => extra
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .or_else(|| node.get_path(key).map(value_string))
                .unwrap_or_else(|| "(unknown)".to_string()),
        };
        out.push_str(&value);
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Message for a violation: the rule's template if it has one
pub(crate) fn render(
    template: Option<&str>,
    default: &str,
    node: &Node,
    extra: &[(&str, &str)],
) -> String {
    format_message(template.unwrap_or(default), node, extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SourceText, Span};
    use crate::tree::Tree;
    use serde_json::json;
    use std::path::Path;

    #[test]
    fn test_name_pattern() {
        let exact = NamePattern::try_from("Package".to_string()).unwrap();
        assert!(exact.is_match("Package"));
        assert!(!exact.is_match("Packages"));

        let wild = NamePattern::try_from("Comp*".to_string()).unwrap();
        assert!(wild.is_match("Component"));
        assert!(wild.is_match("ComponentGroup"));
        assert!(!wild.is_match("MyComponent"));

        let dotted = NamePattern::try_from("a.?".to_string()).unwrap();
        assert!(dotted.is_match("a.b"));
        assert!(!dotted.is_match("axb"));
    }

    #[test]
    fn test_format_message() {
        let node = Node::new("element", Span::new(0, 1))
            .with_attr("name", "File")
            .with_attr("fields", json!({"Source": "C:\\x"}));

        assert_eq!(
            format_message("{kind} '{name}' uses {fields.Source} ({field})", &node, &[("field", "Source")]),
            "element 'File' uses C:\\x (Source)"
        );
        assert_eq!(format_message("{missing} {", &node, &[]), "(unknown) {");
    }

    #[test]
    fn test_rule_file_deserialize() {
        let yaml = r#"
version: "1.0"
rules:
  - id: package-requires-version
    kind: required-field
    severity: error
    target:
      kind: element
      name: Package
    field: Version
    default: "1.0.0.0"
  - id: component-name
    kind: naming-case
    enabled: false
    target: { kind: element, name: "Comp*" }
    field: Id
    case: pascal
  - id: strict-equality
    kind: token-replace
    target: { kind: operator }
    from: "=="
    to: "==="
  - id: no-empty-id
    kind: condition
    condition: "isEmpty(fields.Id) && !hasChild('Id')"
    message: "{name} needs an Id"
"#;
        let file = RuleFile::from_yaml_str(yaml).unwrap();
        assert_eq!(file.version.as_deref(), Some("1.0"));
        assert_eq!(file.rules.len(), 4);
        assert_eq!(file.rules[1].id(), "component-name");

        let mut registry = RuleRegistry::new();
        assert_eq!(registry.register_definitions(file).unwrap(), 4);

        let rule = registry.get("package-requires-version").unwrap();
        assert_eq!(rule.default_severity(), Severity::Error);
        assert!(rule.can_fix());
        assert!(!registry.get("component-name").unwrap().enabled_by_default());
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let bad_condition = r#"{"rules": [{"id": "x", "kind": "condition", "condition": "name =~ /(/"}]}"#;
        assert!(RuleFile::from_json_str(bad_condition).is_err());

        let bad_range = r#"{"rules": [{"id": "r", "kind": "value-range", "field": "n", "min": 5, "max": 1}]}"#;
        let file = RuleFile::from_json_str(bad_range).unwrap();
        let err = RuleRegistry::new().register_definitions(file).unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid { .. }));

        let dup = r#"{"rules": [
            {"id": "d", "kind": "required-flag", "attribute": "typed"},
            {"id": "d", "kind": "required-flag", "attribute": "typed"}
        ]}"#;
        let err = RuleRegistry::new()
            .register_definitions(RuleFile::from_json_str(dup).unwrap())
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Registry(ConfigError::DuplicateRule(_))));
    }

    #[test]
    fn test_target_filters_nodes() {
        let source = SourceText::new("x".repeat(10));
        let root = Node::new("document", Span::new(0, 10))
            .with_child(Node::new("element", Span::new(0, 4)).with_attr("name", "Component"))
            .with_child(Node::new("element", Span::new(5, 10)).with_attr("name", "File"));
        let tree = Tree::new(root, &source).unwrap();

        let target = Target::kind("element").with_name("Comp*").unwrap();
        let hits: Vec<_> = tree.iter().filter(|n| target.matches(n)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), Some("Component"));

        let rule = Defined::new(
            RuleMeta::new("flag-typed", Target::kind("element")),
            RequiredFlag::new("typed"),
        );
        let options = Value::Null;
        let ctx = RuleContext::new(
            &tree,
            &source.text,
            Path::new("a.xml"),
            "flag-typed",
            Severity::Warning,
            &options,
        );
        assert_eq!(rule.evaluate(&ctx).len(), 2);
    }
}
