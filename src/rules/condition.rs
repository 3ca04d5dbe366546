//! Declarative condition rules
//!
//! A condition is a small boolean expression over one node:
//!
//! - `a && b`, `a || b`, `!a`, parentheses
//! - `path == 'text'`, `path != 'text'`, `path =~ /regex/` (`/regex/i` ignores case)
//! - `hasChild('Name')`, `isEmpty(path)`
//! - a bare path tests that the value exists
//!
//! Paths are `name`, `kind`, `text` or a dotted attribute path such as
//! `fields.Id`.

use super::{format_message, insert_offset, render, value_string, NodeCheck};
use crate::diagnostic::{Diagnostic, Edit, Fix};
use crate::rule::RuleContext;
use crate::tree::Node;
use regex::Regex;
use serde::Deserialize;
use std::fmt;

/// Parsed condition expression
#[derive(Debug, Clone)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Eq(String, String),
    Ne(String, String),
    Matches(String, Regex),
    HasChild(String),
    IsEmpty(String),
    Exists(String),
}

/// A condition string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionError {
    pub condition: String,
    pub message: String,
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid condition '{}': {}", self.condition, self.message)
    }
}

impl std::error::Error for ConditionError {}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        parse_expr(input).map_err(|message| ConditionError {
            condition: input.to_string(),
            message,
        })
    }

    /// Evaluate against one node
    pub fn eval(&self, node: &Node, source: &str) -> bool {
        match self {
            Condition::Or(a, b) => a.eval(node, source) || b.eval(node, source),
            Condition::And(a, b) => a.eval(node, source) && b.eval(node, source),
            Condition::Not(inner) => !inner.eval(node, source),
            Condition::Eq(path, expected) => {
                get_value(path, node, source).is_some_and(|v| v == *expected)
            }
            Condition::Ne(path, expected) => {
                get_value(path, node, source).is_none_or(|v| v != *expected)
            }
            Condition::Matches(path, re) => {
                get_value(path, node, source).is_some_and(|v| re.is_match(&v))
            }
            Condition::HasChild(name) => {
                node.children().iter().any(|c| c.name() == Some(name.as_str()))
            }
            Condition::IsEmpty(path) => get_value(path, node, source).is_none_or(|v| v.is_empty()),
            Condition::Exists(path) => get_value(path, node, source).is_some(),
        }
    }
}

impl std::str::FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Condition::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn parse_expr(input: &str) -> Result<Condition, String> {
    let expr = input.trim();
    if expr.is_empty() {
        return Err("empty expression".to_string());
    }

    if let Some(idx) = find_logical_operator(expr, "||")? {
        return Ok(Condition::Or(
            Box::new(parse_expr(&expr[..idx])?),
            Box::new(parse_expr(&expr[idx + 2..])?),
        ));
    }

    if let Some(idx) = find_logical_operator(expr, "&&")? {
        return Ok(Condition::And(
            Box::new(parse_expr(&expr[..idx])?),
            Box::new(parse_expr(&expr[idx + 2..])?),
        ));
    }

    if let Some(rest) = expr.strip_prefix('!') {
        if !rest.starts_with('=') {
            return Ok(Condition::Not(Box::new(parse_expr(rest)?)));
        }
    }

    if let Some(inner) = expr.strip_prefix('(').and_then(|e| e.strip_suffix(')')) {
        return parse_expr(inner);
    }

    if let Some((idx, op)) = find_comparison(expr) {
        let path = expr[..idx].trim();
        let rhs = expr[idx + op.len()..].trim();
        if path.is_empty() {
            return Err(format!("missing left side of '{}'", op));
        }
        return match op {
            "=~" => Ok(Condition::Matches(path.to_string(), regex_literal(rhs)?)),
            "==" => Ok(Condition::Eq(path.to_string(), unquote(rhs).to_string())),
            _ => Ok(Condition::Ne(path.to_string(), unquote(rhs).to_string())),
        };
    }

    if let Some(arg) = call_argument(expr, "hasChild") {
        return Ok(Condition::HasChild(unquote(arg).to_string()));
    }
    if let Some(arg) = call_argument(expr, "isEmpty") {
        return Ok(Condition::IsEmpty(arg.trim().to_string()));
    }

    if expr.contains(|c: char| c.is_whitespace() || "()=!<>".contains(c)) {
        return Err(format!("unexpected '{}'", expr));
    }
    Ok(Condition::Exists(expr.to_string()))
}

/// Find a logical operator outside parentheses, quotes and regex literals
///
/// A `/` only opens a regex literal right after `=~`.
fn find_logical_operator(s: &str, op: &str) -> Result<Option<usize>, String> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 0;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    let mut regex_next = false;
    let mut found = None;

    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if q == b'/' && b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'/' if regex_next => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced ')'".to_string());
                }
            }
            _ => {}
        }
        if b == b'~' && i > 0 && bytes[i - 1] == b'=' {
            regex_next = true;
        } else if !b.is_ascii_whitespace() {
            regex_next = false;
        }
        if found.is_none() && depth == 0 && bytes[i..].starts_with(op.as_bytes()) {
            found = Some(i);
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {}", q as char));
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    Ok(found)
}

/// Leftmost `==`, `!=` or `=~`
fn find_comparison(expr: &str) -> Option<(usize, &'static str)> {
    ["==", "!=", "=~"]
        .into_iter()
        .filter_map(|op| expr.find(op).map(|idx| (idx, op)))
        .min_by_key(|&(idx, _)| idx)
}

/// `/pattern/flags` (only `i` is supported) or a bare pattern
fn regex_literal(literal: &str) -> Result<Regex, String> {
    let (pattern, flags) = match literal.strip_prefix('/').and_then(|r| r.rsplit_once('/')) {
        Some((pattern, flags)) => (pattern, flags),
        None => (literal, ""),
    };
    if let Some(flag) = flags.chars().find(|&c| c != 'i') {
        return Err(format!("unsupported regex flag '{}'", flag));
    }

    let pattern = if flags.contains('i') {
        format!("(?i){}", pattern)
    } else {
        pattern.to_string()
    };
    Regex::new(&pattern).map_err(|e| e.to_string())
}

fn call_argument<'a>(expr: &'a str, function: &str) -> Option<&'a str> {
    expr.strip_prefix(function)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

/// Get a value from a node based on path
fn get_value(path: &str, node: &Node, source: &str) -> Option<String> {
    match path {
        "name" => node.name().map(String::from),
        "kind" => Some(node.kind().to_string()),
        "text" => node.text(source).map(String::from),
        _ => node.get_path(path).map(value_string),
    }
}

/// Fix applied when a condition rule fires
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ConditionFix {
    /// Replace the node's text; the value is a message template
    ReplaceNode { value: String },
    /// Delete the node's text
    RemoveNode,
    /// Insert a field at the node's `insertAt` offset
    InsertField {
        field: String,
        value: String,
        #[serde(default = "default_insert")]
        template: String,
    },
}

fn default_insert() -> String {
    r#" {field}="{value}""#.to_string()
}

/// A condition with a message and an optional fix
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionCheck {
    pub condition: Condition,
    #[serde(default)]
    pub fix: Option<ConditionFix>,
}

impl ConditionCheck {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            fix: None,
        }
    }

    pub fn with_fix(mut self, fix: ConditionFix) -> Self {
        self.fix = Some(fix);
        self
    }

    fn build_fix(&self, node: &Node) -> Option<Fix> {
        let edit = match self.fix.as_ref()? {
            ConditionFix::ReplaceNode { value } => {
                Edit::replace(node.span(), &format_message(value, node, &[]))
            }
            ConditionFix::RemoveNode => Edit::delete(node.span()),
            ConditionFix::InsertField {
                field,
                value,
                template,
            } => {
                let text = template.replace("{field}", field).replace("{value}", value);
                Edit::insert(insert_offset(node)?, &text)
            }
        };
        Some(Fix::single(edit))
    }
}

impl NodeCheck for ConditionCheck {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        if !self.condition.eval(node, ctx.source) {
            return None;
        }

        let text = render(message, "{kind} '{name}' matches a disallowed pattern", node, &[]);
        let diag = ctx.report(node.span(), &text);
        Some(match self.build_fix(node) {
            Some(fix) => diag.with_fix(fix),
            None => diag,
        })
    }

    fn can_fix(&self) -> bool {
        self.fix.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use serde_json::json;

    fn node() -> Node {
        Node::new("element", Span::new(0, 10))
            .with_attr("name", "File")
            .with_attr("fields", json!({"Source": "C:\\bin\\app.exe", "Id": ""}))
            .with_child(Node::new("attribute", Span::new(6, 9)).with_attr("name", "Source"))
    }

    fn eval(condition: &str) -> bool {
        Condition::parse(condition).unwrap().eval(&node(), "<File a=b/>")
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("name == 'File'"));
        assert!(eval("name != \"Dir\""));
        assert!(eval("fields.Source =~ /^[A-Z]:\\\\/"));
        assert!(!eval("fields.Source =~ /^\\$\\(var\\./"));
        assert!(eval("fields.Missing != 'x'"));
        assert!(!eval("fields.Missing == 'x'"));
        assert!(eval("kind == element"));
        assert!(eval("name =~ /^file$/i"));
        assert!(!eval("name =~ /^file$/"));
        assert!(Condition::parse("name =~ /x/g").is_err());
    }

    #[test]
    fn test_logic_and_functions() {
        assert!(eval("hasChild('Source') && isEmpty(fields.Id)"));
        assert!(eval("!hasChild('Other') && (name == 'Dir' || name == 'File')"));
        assert!(!eval("!(fields.Source)"));
        assert!(eval("isEmpty(fields.Missing)"));
        assert!(eval("fields.Source && !fields.Missing"));
    }

    #[test]
    fn test_operators_inside_quotes_are_literal() {
        let cond = Condition::parse("name == 'a || b'").unwrap();
        assert!(matches!(cond, Condition::Eq(_, ref v) if v == "a || b"));
    }

    #[test]
    fn test_slash_outside_regex_is_literal() {
        let cond = Condition::parse("fields.Source == C:/x && name == 'File'").unwrap();
        match cond {
            Condition::And(left, right) => {
                assert!(matches!(*left, Condition::Eq(ref p, ref v) if p == "fields.Source" && v == "C:/x"));
                assert!(matches!(*right, Condition::Eq(ref p, ref v) if p == "name" && v == "File"));
            }
            other => panic!("expected a conjunction, got {:?}", other),
        }
        assert!(eval("name =~ /x|File/ && kind == element"));
    }

    #[test]
    fn test_unterminated_quotes_are_errors() {
        assert!(Condition::parse("name == 'File").is_err());
        assert!(Condition::parse("name == \"File").is_err());
        assert!(Condition::parse("name =~ /File && kind == element").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("(name == 'x'").is_err());
        assert!(Condition::parse("name =~ /(/").is_err());
        assert!(Condition::parse("== 'x'").is_err());
        assert!(Condition::parse("name is File").is_err());
    }

    #[test]
    fn test_fix_actions() {
        let node = node().with_attr("insertAt", 9);

        let check = ConditionCheck::new(Condition::parse("name == 'File'").unwrap())
            .with_fix(ConditionFix::InsertField {
                field: "Vital".to_string(),
                value: "yes".to_string(),
                template: default_insert(),
            });
        assert_eq!(
            check.build_fix(&node).unwrap().edits,
            vec![Edit::insert(9, r#" Vital="yes""#)]
        );

        let check = ConditionCheck::new(Condition::parse("name").unwrap())
            .with_fix(ConditionFix::ReplaceNode {
                value: "<{name}/>".to_string(),
            });
        assert_eq!(
            check.build_fix(&node).unwrap().edits,
            vec![Edit::replace(Span::new(0, 10), "<File/>")]
        );

        let check = ConditionCheck::new(Condition::parse("name").unwrap())
            .with_fix(ConditionFix::RemoveNode);
        assert_eq!(
            check.build_fix(&node).unwrap().edits,
            vec![Edit::delete(Span::new(0, 10))]
        );
    }
}
