//! Conform - Structural Linter Engine with Convergent Auto-Fix
//!
//! A language-agnostic linter core. Parsers turn source text into a generic
//! node tree, rules inspect that tree and report diagnostics with optional
//! fixes, and the fix engine rewrites the document pass after pass until no
//! fixable diagnostic remains.
//!
//! # Architecture
//!
//! ```text
//! source -> Parser -> Tree -> Evaluator -> Diagnostics -> compose -> Patch -> source'
//! ```
//!
//! Every pass works on one immutable document version. Fixes from different
//! rules are merged into a single non-overlapping patch; fixes that collide are
//! deferred to the next pass, on the freshly parsed tree. The loop stops at a
//! fixed point, at the pass limit, when a text repeats, or on cancellation.
//!
//! # Declaring Rules
//!
//! Rules can be written in Rust (implement [`Rule`]) or declared in a rule file:
//!
//! ```yaml
//! rules:
//!   - id: component-requires-guid
//!     kind: required-field
//!     target: { kind: element, name: Component }
//!     field: Guid
//!     default: "*"
//!
//!   - id: no-empty-id
//!     kind: condition
//!     target: { kind: element }
//!     condition: "fields.Id == ''"
//!     message: "<{name}> has an empty Id"
//!     severity: error
//! ```

pub mod compose;
pub mod config;
pub mod diagnostic;
pub mod engine;
pub mod evaluate;
pub mod fixer;
pub mod plugins;
pub mod registry;
pub mod rule;
pub mod rules;
pub mod span;
pub mod tree;

// Re-export main types
pub use compose::{compose, FixConflictError, MalformedFix, Patch, PatchError, PatchResult};
pub use config::{Config, ConfigError, EngineConfig, PathFilter, PathOverride, RuleConfig};
pub use diagnostic::{Diagnostic, DiagnosticSet, Edit, Fix, Severity};
pub use engine::{BatchReport, Document, DocumentReport, LintError, Linter, RunSummary};
pub use evaluate::{Evaluation, Evaluator, RuleTiming};
pub use fixer::{
    CancellationToken, CapReason, FixEngine, FixFailure, FixOutcome, FixReport, PassRecord,
};
pub use plugins::XmlParser;
pub use registry::{ActiveRule, ActiveRuleSet, RuleRegistry};
pub use rule::{Rule, RuleContext};
pub use rules::{DefinitionError, RuleDefinition, RuleFile};
pub use span::{DocumentVersion, SourceText, Span};
pub use tree::{parse_tree, Node, ParseFailure, Parser, Suppression, Tree, PARSE_ERROR_RULE};
