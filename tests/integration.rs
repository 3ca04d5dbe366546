//! Integration tests for the lint and fix engine, driven through the XML parser

use conform::{
    CapReason, Config, ConfigError, Document, FixFailure, FixOutcome, Linter, RuleFile,
    RuleRegistry, Severity, XmlParser, PARSE_ERROR_RULE,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

const COMPONENT_RULES: &str = r#"
rules:
  - id: component-guid
    kind: required-field
    description: Components need a Guid
    target: { kind: element, name: Component }
    field: Guid
    default: "*"

  - id: component-win64
    kind: required-field
    target: { kind: element, name: Component }
    field: Win64
    default: "no"
    severity: info

  - id: feature-level
    kind: value-range
    target: { kind: element, name: Feature }
    field: Level
    min: 1
    max: 1000

  - id: feature-display
    kind: allowed-values
    target: { kind: element, name: Feature }
    field: Display
    values: [collapse, expand, hidden]
    severity: error
"#;

const FLIP_RULES: &str = r#"
rules:
  - id: flip-yes
    kind: token-replace
    target: { kind: attribute, name: Enabled }
    from: "yes"
    to: "no"

  - id: flip-no
    kind: token-replace
    target: { kind: attribute, name: Enabled }
    from: "no"
    to: "yes"
"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn registry(rules: &str) -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    registry
        .register_definitions(RuleFile::from_yaml_str(rules).unwrap())
        .unwrap();
    registry
}

fn linter_with(config: Config, rules: &str) -> Linter {
    init_logging();
    Linter::new(config, registry(rules))
        .unwrap()
        .with_parser(Arc::new(XmlParser::new()))
}

/// Only the Guid rule
fn guid_linter() -> Linter {
    let config = Config::from_yaml_str(
        r#"
rules:
  component-win64:
    enabled: false
"#,
    )
    .unwrap();
    linter_with(config, COMPONENT_RULES)
}

#[test]
fn test_required_field_fix_converges_in_one_pass() {
    let linter = guid_linter();
    let input = "<Package>\n  <Component Id=\"A\"/>\n  <Component Id=\"B\" Guid=\"x\"/>\n</Package>\n";
    let path = Path::new("product.xml");

    let diags = linter.check(input, path).unwrap();
    assert_eq!(diags.len(), 1);
    let diag = &diags.as_slice()[0];
    assert_eq!(diag.rule_id, "component-guid");
    assert_eq!(diag.severity, Severity::Warning);
    assert_eq!(diag.message, "element 'Component' is missing required field 'Guid'");
    assert_eq!(&input[diag.span.start..diag.span.end], "<Component Id=\"A\"/>");
    assert!(diag.has_fix());

    let report = linter.fix(input, path).unwrap();
    assert_eq!(report.outcome, FixOutcome::Converged);
    assert_eq!(
        report.final_text,
        "<Package>\n  <Component Id=\"A\" Guid=\"*\"/>\n  <Component Id=\"B\" Guid=\"x\"/>\n</Package>\n"
    );
    assert_eq!(report.passes, 1);
    assert!(report.diagnostics.is_empty());
    assert_eq!(report.history.len(), 2);
    assert!(report.history[0].applied);
    assert_eq!(report.history[0].accepted, 1);
    assert!(!report.history[1].applied);
}

#[test]
fn test_same_point_insertions_take_two_passes() {
    let linter = linter_with(Config::new(), COMPONENT_RULES);
    let report = linter
        .fix(r#"<Component Id="A"/>"#, Path::new("a.xml"))
        .unwrap();

    assert!(report.outcome.is_converged());
    assert_eq!(
        report.final_text,
        r#"<Component Id="A" Guid="*" Win64="no"/>"#
    );
    assert_eq!(report.passes, 2);
    assert_eq!(report.history[0].accepted, 1);
    assert_eq!(report.history[0].deferred, 1);
    assert_eq!(report.history[1].accepted, 1);
    assert!(report.diagnostics.is_empty());
}

#[test]
fn test_pass_limit_keeps_residual_diagnostics() {
    let linter = linter_with(Config::new().with_max_passes(1), COMPONENT_RULES);
    let report = linter
        .fix(r#"<Component Id="A"/>"#, Path::new("a.xml"))
        .unwrap();

    assert_eq!(report.outcome, FixOutcome::Capped(CapReason::IterationLimit));
    assert_eq!(report.final_text, r#"<Component Id="A" Guid="*"/>"#);
    assert_eq!(report.passes, 1);

    let residual: Vec<&str> = report
        .diagnostics
        .iter()
        .map(|d| d.rule_id.as_str())
        .collect();
    assert_eq!(residual, vec!["component-win64"]);
}

#[test]
fn test_non_confluent_rules_are_capped() {
    let linter = linter_with(Config::new(), FLIP_RULES);
    let input = r#"<Feature Enabled="yes"/>"#;
    let report = linter.fix(input, Path::new("a.xml")).unwrap();

    assert_eq!(report.outcome, FixOutcome::Capped(CapReason::Oscillation));
    assert_eq!(report.final_text, input);
    assert_eq!(report.passes, 2);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics.as_slice()[0].rule_id, "flip-yes");
}

#[test]
fn test_unknown_rule_fails_the_run() {
    init_logging();
    let config = Config::from_yaml_str(
        r#"
rules:
  DOES_NOT_EXIST:
    severity: error
"#,
    )
    .unwrap();

    match Linter::new(config, registry(COMPONENT_RULES)) {
        Err(ConfigError::UnknownRule { rule_id, .. }) => assert_eq!(rule_id, "DOES_NOT_EXIST"),
        other => panic!("expected an unknown rule error, got {:?}", other.err()),
    }
}

#[test]
fn test_bad_severity_and_options_fail_the_run() {
    init_logging();
    let config = Config::from_yaml_str(
        r#"
overrides:
  - include: ["legacy/**"]
    rules:
      component-guid:
        severity: fatal
"#,
    )
    .unwrap();
    assert!(matches!(
        Linter::new(config, registry(COMPONENT_RULES)),
        Err(ConfigError::InvalidSeverity { .. })
    ));

    let config = Config::from_yaml_str(
        r#"
rules:
  feature-level:
    options: { maximum: 3 }
"#,
    )
    .unwrap();
    assert!(matches!(
        Linter::new(config, registry(COMPONENT_RULES)),
        Err(ConfigError::InvalidOptions { .. })
    ));
}

#[test]
fn test_path_overrides_and_options() {
    let config = Config::from_yaml_str(
        r#"
engine:
  jobs: 2
rules:
  component-win64:
    enabled: false
  feature-level:
    options: { max: 10 }
overrides:
  - include: ["legacy/**"]
    rules:
      component-guid:
        enabled: false
  - include: ["legacy/strict/**"]
    rules:
      component-guid:
        enabled: true
        severity: error
"#,
    )
    .unwrap();
    let linter = linter_with(config, COMPONENT_RULES);
    let input = r#"<Package><Component Id="A"/><Feature Level="20" Display="expand"/></Package>"#;

    let rule_ids = |path: &str| -> Vec<(String, Severity)> {
        linter
            .check(input, Path::new(path))
            .unwrap()
            .iter()
            .map(|d| (d.rule_id.clone(), d.severity))
            .collect()
    };

    assert_eq!(
        rule_ids("src/a.xml"),
        vec![
            ("component-guid".to_string(), Severity::Warning),
            ("feature-level".to_string(), Severity::Warning),
        ]
    );
    assert_eq!(
        rule_ids("legacy/a.xml"),
        vec![("feature-level".to_string(), Severity::Warning)]
    );
    assert_eq!(
        rule_ids("legacy/strict/a.xml"),
        vec![
            ("component-guid".to_string(), Severity::Error),
            ("feature-level".to_string(), Severity::Warning),
        ]
    );
}

#[test]
fn test_suppression_comments() {
    let linter = guid_linter();
    let path = Path::new("a.xml");

    let input = r#"<Package>
  <!-- conform-disable component-guid -->
  <Component Id="A"/>
</Package>"#;
    assert!(linter.check(input, path).unwrap().is_empty());

    let input = r#"<Package>
  <!-- conform-disable-next component-guid -->
  <Component Id="A"/>
  <Component Id="B"/>
</Package>"#;
    let diags = linter.check(input, path).unwrap();
    assert_eq!(diags.len(), 1);
    let span = diags.as_slice()[0].span;
    assert_eq!(&input[span.start..span.end], r#"<Component Id="B"/>"#);

    let report = linter.fix(input, path).unwrap();
    assert!(report.final_text.contains(r#"<Component Id="A"/>"#));
    assert!(report.final_text.contains(r#"<Component Id="B" Guid="*"/>"#));
}

#[test]
fn test_fix_is_idempotent() {
    let linter = linter_with(Config::new(), COMPONENT_RULES);
    let path = Path::new("a.xml");
    let first = linter
        .fix(r#"<Package><Component Id="A"/><Component/></Package>"#, path)
        .unwrap();
    assert!(first.outcome.is_converged());

    let second = linter.fix(&first.final_text, path).unwrap();
    assert!(second.outcome.is_converged());
    assert!(!second.changed());
    assert_eq!(second.final_text, first.final_text);
    assert_eq!(second.passes, 1);
    assert_eq!(second.history.len(), 1);
    assert_eq!(second.history[0].accepted, 0);
}

#[test]
fn test_runs_are_deterministic() {
    let docs: Vec<Document> = (0..16)
        .map(|i| {
            Document::new(
                format!("doc{}.xml", i),
                format!(
                    r#"<Package><Component Id="C{}"/><Feature Level="{}" Display="open"/></Package>"#,
                    i,
                    i * 100
                ),
            )
        })
        .collect();

    let parallel = linter_with(Config::new(), COMPONENT_RULES);
    let mut config = Config::new();
    config.engine.parallel = false;
    config.engine.parallel_rules = false;
    let sequential = linter_with(config, COMPONENT_RULES);

    let a = parallel.fix_all(&docs);
    let b = sequential.fix_all(&docs);
    assert_eq!(a.documents.len(), docs.len());
    for (x, y) in a.documents.iter().zip(&b.documents) {
        assert_eq!(x.path, y.path);
        let (x, y) = (x.result.as_ref().unwrap(), y.result.as_ref().unwrap());
        assert_eq!(x.final_text, y.final_text);
        assert_eq!(x.diagnostics, y.diagnostics);
        assert_eq!(x.passes, y.passes);
    }
    assert_eq!(a.summary.fixed, 16);
    assert_eq!(a.summary.error_count, b.summary.error_count);
    assert_eq!(a.summary.error_count, 16);

    let c = parallel.check_all(&docs);
    let d = parallel.check_all(&docs);
    for (x, y) in c.documents.iter().zip(&d.documents) {
        assert_eq!(x.result.as_ref().unwrap(), y.result.as_ref().unwrap());
    }
}

#[test]
fn test_parse_failures_are_isolated() {
    let linter = guid_linter();
    let docs = vec![
        Document::new("good.xml", r#"<Component Id="A"/>"#),
        Document::new("broken.xml", "<Package><Component Id=\"A\">\n</Package>"),
        Document::new("other.xml", r#"<Component Id="B" Guid="*"/>"#),
    ];

    let batch = linter.fix_all(&docs);
    assert_eq!(batch.summary.documents, 3);
    assert_eq!(batch.summary.failed, 1);
    assert_eq!(batch.summary.fixed, 1);

    let good = batch.documents[0].result.as_ref().unwrap();
    assert_eq!(good.final_text, r#"<Component Id="A" Guid="*"/>"#);

    let broken = batch.documents[1].result.as_ref().unwrap();
    assert!(matches!(broken.outcome, FixOutcome::Failed(FixFailure::Parse(_))));
    assert_eq!(broken.final_text, docs[1].text);
    assert_eq!(broken.diagnostics.len(), 1);
    assert_eq!(broken.diagnostics.as_slice()[0].rule_id, PARSE_ERROR_RULE);
    assert_eq!(broken.diagnostics.as_slice()[0].severity, Severity::Error);

    let diags = linter.check(&docs[1].text, Path::new("broken.xml")).unwrap();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags.as_slice()[0].rule_id, PARSE_ERROR_RULE);

    let other = batch.documents[2].result.as_ref().unwrap();
    assert!(!other.changed());
}

#[test]
fn test_cancellation_keeps_source() {
    let linter = linter_with(Config::new(), COMPONENT_RULES);
    linter.cancellation_token().cancel();

    let input = r#"<Component Id="A"/>"#;
    let report = linter.fix(input, Path::new("a.xml")).unwrap();
    assert_eq!(report.outcome, FixOutcome::Cancelled);
    assert_eq!(report.final_text, input);
    assert_eq!(report.diagnostics.len(), 2);
}

#[test]
fn test_excluded_files_are_skipped() {
    let config = Config::from_yaml_str(
        r#"
files:
  include: ["**/*.xml"]
  exclude: ["generated/**"]
"#,
    )
    .unwrap();
    let linter = linter_with(config, COMPONENT_RULES);
    let input = r#"<Component Id="A"/>"#;

    assert!(linter.check(input, Path::new("generated/a.xml")).unwrap().is_empty());
    let report = linter.fix(input, Path::new("generated/a.xml")).unwrap();
    assert_eq!(report.final_text, input);
    assert_eq!(linter.check(input, Path::new("src/a.xml")).unwrap().len(), 2);
}

#[test]
fn test_condition_rules_from_json() {
    init_logging();
    let rules = RuleFile::from_json_str(
        r#"{
            "rules": [{
                "id": "no-temp-directory",
                "kind": "condition",
                "target": { "kind": "element", "name": "Directory" },
                "condition": "fields.Name =~ /^te?mp$/i && !hasChild('Component')",
                "message": "Directory '{fields.Name}' is empty and temporary",
                "severity": "error",
                "fix": { "action": "remove-node" }
            }]
        }"#,
    )
    .unwrap();
    let mut registry = RuleRegistry::new();
    assert_eq!(registry.register_definitions(rules).unwrap(), 1);
    let linter = Linter::new(Config::new(), registry)
        .unwrap()
        .with_parser(Arc::new(XmlParser::new()));

    let input = r#"<Root><Directory Name="TMP"/><Directory Name="temp"><Component/></Directory></Root>"#;
    let diags = linter.check(input, Path::new("a.xml")).unwrap();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags.as_slice()[0].message, "Directory 'TMP' is empty and temporary");

    let report = linter.fix(input, Path::new("a.xml")).unwrap();
    assert_eq!(
        report.final_text,
        r#"<Root><Directory Name="temp"><Component/></Directory></Root>"#
    );
    assert!(report.diagnostics.is_empty());
}
