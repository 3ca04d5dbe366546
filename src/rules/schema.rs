//! Schema-conformance checks: required fields, enumerations, ranges, naming

use super::{field_span, field_value, insert_offset, render, value_string, NodeCheck};
use crate::diagnostic::{Diagnostic, Edit, Fix};
use crate::rule::{parse_options, RuleContext};
use crate::tree::Node;
use serde::Deserialize;
use serde_json::Value;

/// A keyed field must be present
///
/// With a `default`, the fix inserts the field at the node's `insertAt`
/// offset using the `insert` template.
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredField {
    pub field: String,

    /// Value written by the fix
    #[serde(default)]
    pub default: Option<String>,

    /// Inserted text, `{field}` and `{value}` are substituted
    #[serde(default = "default_insert")]
    pub insert: String,
}

fn default_insert() -> String {
    r#" {field}="{value}""#.to_string()
}

impl RequiredField {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            default: None,
            insert: default_insert(),
        }
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }
}

impl NodeCheck for RequiredField {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        if field_value(node, &self.field).is_some() {
            return None;
        }

        let extra = [("field", self.field.as_str())];
        let text = render(
            message,
            "{kind} '{name}' is missing required field '{field}'",
            node,
            &extra,
        );
        let diag = ctx.report(node.span(), &text);

        match (&self.default, insert_offset(node)) {
            (Some(value), Some(offset)) => {
                let inserted = self
                    .insert
                    .replace("{field}", &self.field)
                    .replace("{value}", value);
                Some(diag.with_fix(
                    Fix::single(Edit::insert(offset, &inserted))
                        .with_description(&format!("Add {}", self.field)),
                ))
            }
            _ => Some(diag),
        }
    }

    fn can_fix(&self) -> bool {
        self.default.is_some()
    }

    fn validate(&self) -> Result<(), String> {
        if self.field.is_empty() {
            return Err("field is empty".to_string());
        }
        Ok(())
    }
}

/// A field, when present, must be one of a fixed set of values
#[derive(Debug, Clone, Deserialize)]
pub struct AllowedValues {
    pub field: String,
    pub values: Vec<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

fn default_true() -> bool {
    true
}

impl AllowedValues {
    pub fn new(field: &str, values: &[&str]) -> Self {
        Self {
            field: field.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            case_sensitive: true,
        }
    }

    fn allows(&self, value: &str) -> bool {
        if self.case_sensitive {
            self.values.iter().any(|v| v == value)
        } else {
            self.values.iter().any(|v| v.eq_ignore_ascii_case(value))
        }
    }
}

impl NodeCheck for AllowedValues {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        let value = value_string(field_value(node, &self.field)?);
        if self.allows(&value) {
            return None;
        }

        let allowed = self.values.join(", ");
        let extra = [
            ("field", self.field.as_str()),
            ("value", value.as_str()),
            ("allowed", allowed.as_str()),
        ];
        let text = render(
            message,
            "'{value}' is not an allowed value for '{field}' (expected one of: {allowed})",
            node,
            &extra,
        );
        let span = field_span(node, &self.field).unwrap_or(node.span());
        Some(ctx.report(span, &text))
    }

    fn validate(&self) -> Result<(), String> {
        if self.values.is_empty() {
            return Err("values is empty".to_string());
        }
        Ok(())
    }
}

/// Numeric bounds, overridable per run through rule options
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RangeOptions {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A field, when present, must be a number inside `[min, max]`
#[derive(Debug, Clone, Deserialize)]
pub struct ValueRange {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ValueRange {
    pub fn new(field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
        }
    }

    fn bounds(&self, options: &Value) -> (Option<f64>, Option<f64>) {
        let overrides: RangeOptions = parse_options(options).unwrap_or_default();
        (overrides.min.or(self.min), overrides.max.or(self.max))
    }
}

impl NodeCheck for ValueRange {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        let raw = field_value(node, &self.field)?;
        let value = value_string(raw);
        let span = field_span(node, &self.field).unwrap_or(node.span());
        let extra_field = ("field", self.field.as_str());

        let number = match raw {
            Value::Number(n) => n.as_f64(),
            _ => value.trim().parse::<f64>().ok(),
        };
        let Some(number) = number else {
            let text = format!("'{}' of '{}' is not a number", value, self.field);
            return Some(ctx.report(span, &text));
        };
        if !number.is_finite() {
            let text = format!("'{}' of '{}' is not a finite number", value, self.field);
            return Some(ctx.report(span, &text));
        }

        let (min, max) = self.bounds(ctx.options());
        let below = min.is_some_and(|min| number < min);
        let above = max.is_some_and(|max| number > max);
        if !below && !above {
            return None;
        }

        let min = min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".to_string());
        let max = max.map(|v| v.to_string()).unwrap_or_else(|| "inf".to_string());
        let extra = [
            extra_field,
            ("value", value.as_str()),
            ("min", min.as_str()),
            ("max", max.as_str()),
        ];
        let text = render(
            message,
            "'{field}' = {value} is outside [{min}, {max}]",
            node,
            &extra,
        );
        Some(ctx.report(span, &text))
    }

    fn validate_options(&self, options: &Value) -> Result<(), String> {
        let opts: RangeOptions = parse_options(options)?;
        let merged = ValueRange {
            field: self.field.clone(),
            min: opts.min.or(self.min),
            max: opts.max.or(self.max),
        };
        merged.validate()
    }

    fn validate(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!("min {} is greater than max {}", min, max));
            }
        }
        Ok(())
    }
}

/// Identifier casing conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Case {
    /// camelCase
    Camel,
    /// PascalCase
    Pascal,
    /// snake_case
    Snake,
    /// kebab-case
    Kebab,
    /// SCREAMING_SNAKE_CASE
    ScreamingSnake,
}

impl Case {
    /// Rewrite `ident` in this case
    pub fn convert(self, ident: &str) -> String {
        let words = split_words(ident);
        match self {
            Case::Camel => words
                .iter()
                .enumerate()
                .map(|(i, w)| if i == 0 { w.to_lowercase() } else { capitalize(w) })
                .collect(),
            Case::Pascal => words.iter().map(|w| capitalize(w)).collect(),
            Case::Snake => join_lower(&words, "_"),
            Case::Kebab => join_lower(&words, "-"),
            Case::ScreamingSnake => join_lower(&words, "_").to_uppercase(),
        }
    }

    pub fn matches(self, ident: &str) -> bool {
        self.convert(ident) == ident
    }
}

impl std::fmt::Display for Case {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Case::Camel => "camelCase",
            Case::Pascal => "PascalCase",
            Case::Snake => "snake_case",
            Case::Kebab => "kebab-case",
            Case::ScreamingSnake => "SCREAMING_SNAKE_CASE",
        };
        write!(f, "{}", name)
    }
}

/// Split on separators and lower-to-upper transitions (`fooBar_baz` -> foo, Bar, baz)
fn split_words(ident: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for c in ident.chars() {
        if c == '_' || c == '-' || c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev = None;
            continue;
        }
        let boundary = c.is_uppercase()
            && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
        prev = Some(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn join_lower(words: &[String], sep: &str) -> String {
    words
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(sep)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CaseOptions {
    case: Option<Case>,
}

/// A node's name (or one of its fields) must follow a casing convention
///
/// The fix rewrites the value in place when the parser exposed a span whose
/// text is exactly the value.
#[derive(Debug, Clone, Deserialize)]
pub struct NamingCase {
    /// Field to check; the node name when absent
    #[serde(default)]
    pub field: Option<String>,
    pub case: Case,
}

impl NamingCase {
    pub fn new(field: Option<&str>, case: Case) -> Self {
        Self {
            field: field.map(String::from),
            case,
        }
    }
}

impl NodeCheck for NamingCase {
    fn check(
        &self,
        ctx: &RuleContext<'_>,
        node: &Node,
        message: Option<&str>,
    ) -> Option<Diagnostic> {
        let case = parse_options::<CaseOptions>(ctx.options())
            .ok()
            .and_then(|o| o.case)
            .unwrap_or(self.case);

        let (value, span) = match &self.field {
            Some(field) => (
                value_string(field_value(node, field)?),
                field_span(node, field),
            ),
            None => (node.name()?.to_string(), Some(node.span())),
        };
        if value.is_empty() || case.matches(&value) {
            return None;
        }

        let expected = case.convert(&value);
        let case_name = case.to_string();
        let extra = [
            ("value", value.as_str()),
            ("case", case_name.as_str()),
            ("expected", expected.as_str()),
        ];
        let text = render(
            message,
            "'{value}' should be {case} ('{expected}')",
            node,
            &extra,
        );

        let exact = span.filter(|s| ctx.text(*s) == Some(value.as_str()));
        let diag = ctx.report(exact.or(span).unwrap_or(node.span()), &text);
        match exact {
            Some(span) if !expected.is_empty() => {
                Some(diag.with_fix(Fix::single(Edit::replace(span, &expected))))
            }
            _ => Some(diag),
        }
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn validate_options(&self, options: &Value) -> Result<(), String> {
        parse_options::<CaseOptions>(options).map(|_| ())
    }
}
