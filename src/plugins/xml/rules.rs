//! Built-in XML rules

use crate::rule::Rule;
use crate::rules::{DefinitionError, RuleFile};
use std::sync::Arc;

const BUILTIN_RULES: &str = r#"
version: "1"
rules:
  - id: xml-empty-attribute
    kind: condition
    description: Identifier attributes must not be empty
    severity: warning
    target: { kind: element }
    condition: "fields.Id == '' || fields.Name == '' || fields.Value == ''"
    message: "Element <{name}> has an empty attribute value"

  - id: xml-encoding-missing
    kind: condition
    description: The XML declaration should name its encoding
    severity: info
    target: { kind: declaration }
    condition: "!fields.encoding"
    message: "XML declaration should specify encoding (e.g., encoding=\"utf-8\")"
    fix:
      action: insert-field
      field: encoding
      value: utf-8
"#;

/// Rule file shipped with the XML parser
pub fn builtin_rule_file() -> Result<RuleFile, DefinitionError> {
    RuleFile::from_yaml_str(BUILTIN_RULES)
}

/// Get all built-in XML rules
pub fn builtin_rules() -> Result<Vec<Arc<dyn Rule>>, DefinitionError> {
    builtin_rule_file()?
        .rules
        .into_iter()
        .map(|definition| definition.into_rule())
        .collect()
}
