//! XML parser
//!
//! Reference implementation of the parser contract for XML documents.

pub mod document;
pub mod rules;

pub use document::parse_xml;
pub use rules::builtin_rules;

use crate::tree::{Node, ParseFailure, Parser};
use std::path::Path;

/// XML language parser
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlParser;

impl XmlParser {
    pub fn new() -> Self {
        Self
    }
}

impl Parser for XmlParser {
    fn id(&self) -> &str {
        "xml"
    }

    fn extensions(&self) -> &[&str] {
        &["xml"]
    }

    fn parse(&self, text: &str, _path: &Path) -> Result<Node, ParseFailure> {
        parse_xml(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Linter;
    use crate::registry::RuleRegistry;
    use std::sync::Arc;

    fn linter() -> Linter {
        let mut registry = RuleRegistry::new();
        for rule in builtin_rules().unwrap() {
            registry.register(rule).unwrap();
        }
        Linter::new(Config::default(), registry)
            .unwrap()
            .with_parser(Arc::new(XmlParser::new()))
    }

    #[test]
    fn test_parser_identity() {
        let parser = XmlParser::new();
        assert_eq!(parser.id(), "xml");
        assert_eq!(parser.extensions(), &["xml"]);
    }

    #[test]
    fn test_builtin_rules_on_document() {
        let text = r#"<?xml version="1.0"?><root Id=""/>"#;
        let diags = linter().check(text, Path::new("a.xml")).unwrap();
        let ids: Vec<&str> = diags.as_slice().iter().map(|d| d.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["xml-encoding-missing", "xml-empty-attribute"]);
    }

    #[test]
    fn test_encoding_fix() {
        let text = r#"<?xml version="1.0"?><root Id="a"/>"#;
        let report = linter().fix(text, Path::new("a.xml")).unwrap();
        assert!(report.outcome.is_converged());
        assert_eq!(
            report.final_text,
            r#"<?xml version="1.0" encoding="utf-8"?><root Id="a"/>"#
        );
        assert!(report.diagnostics.is_empty());
    }
}
