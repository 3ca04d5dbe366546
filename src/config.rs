//! Configuration model for the linter engine
//!
//! Configuration is an in-memory structure; callers may build it directly or
//! deserialize it from a YAML/JSON string:
//! - `engine`: worker pool and fix-loop settings
//! - `files`: global include/exclude globs
//! - `rules`: per-rule enablement, severity and options
//! - `overrides`: path-specific rule settings

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default cap on fix passes per document
pub const DEFAULT_MAX_PASSES: usize = 10;

/// Configuration error
///
/// Any of these is fatal for the whole run: a mis-specified policy must not
/// silently enforce something else.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown rule '{rule_id}' in {scope}")]
    UnknownRule { rule_id: String, scope: String },

    #[error("Invalid severity '{token}' for rule '{rule_id}'")]
    InvalidSeverity { rule_id: String, token: String },

    #[error("Invalid options for rule '{rule_id}': {message}")]
    InvalidOptions { rule_id: String, message: String },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("Duplicate rule id '{0}'")]
    DuplicateRule(String),

    #[error("Rule id '{0}' is reserved")]
    ReservedRule(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Process documents in parallel
    pub parallel: bool,

    /// Number of parallel jobs (0 = auto-detect)
    pub jobs: usize,

    /// Evaluate rules of one pass in parallel
    pub parallel_rules: bool,

    /// Maximum number of fix passes per document
    pub max_passes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            jobs: 0,
            parallel_rules: true,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

/// Include/exclude glob patterns
///
/// An empty include list matches every path; exclusions always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PathFilter {
    pub fn include(patterns: &[&str]) -> Self {
        Self {
            include: patterns.iter().map(|p| p.to_string()).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn with_exclude(mut self, patterns: &[&str]) -> Self {
        self.exclude.extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    /// Compile the patterns
    pub fn compile(&self) -> Result<CompiledPathFilter, ConfigError> {
        Ok(CompiledPathFilter {
            include: build_globset(&self.include)?,
            include_specificity: self.include.iter().map(|p| specificity(p)).collect(),
            exclude: build_globset(&self.exclude)?,
            match_all: self.include.is_empty(),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidGlob {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| ConfigError::InvalidGlob {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

/// Number of literal characters in a glob; longer literal prefixes and names
/// make a pattern more specific
fn specificity(pattern: &str) -> usize {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
        .count()
}

/// A [`PathFilter`] ready for matching
#[derive(Debug, Clone)]
pub struct CompiledPathFilter {
    include: GlobSet,
    include_specificity: Vec<usize>,
    exclude: GlobSet,
    match_all: bool,
}

impl CompiledPathFilter {
    pub fn is_match(&self, path: &Path) -> bool {
        self.match_specificity(path).is_some()
    }

    /// Specificity of the best include pattern matching `path`, or `None` if
    /// the path is not selected
    pub fn match_specificity(&self, path: &Path) -> Option<usize> {
        if self.exclude.is_match(path) {
            return None;
        }
        if self.match_all {
            return Some(0);
        }
        self.include
            .matches(path)
            .into_iter()
            .map(|idx| self.include_specificity[idx])
            .max()
    }
}

/// Per-rule configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Enable or disable the rule (None = keep the inherited state)
    pub enabled: Option<bool>,

    /// Severity token ("error", "warning", "info"); validated at resolve time
    pub severity: Option<String>,

    /// Free-form options, validated by the rule itself
    pub options: Value,
}

impl RuleConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: Some(false),
            ..Self::default()
        }
    }

    pub fn with_severity(mut self, token: &str) -> Self {
        self.severity = Some(token.to_string());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Layer `other` on top of this entry
    pub fn merge(&mut self, other: &RuleConfig) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.severity.is_some() {
            self.severity = other.severity.clone();
        }
        if !other.options.is_null() {
            self.options = other.options.clone();
        }
    }
}

/// Rule settings that only apply to matching paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOverride {
    /// Paths this override applies to
    #[serde(flatten)]
    pub files: PathFilter,

    /// Rule settings (rule_id -> config)
    pub rules: BTreeMap<String, RuleConfig>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine settings
    pub engine: EngineConfig,

    /// Paths the run applies to
    pub files: PathFilter,

    /// Global rule settings (rule_id -> config)
    pub rules: BTreeMap<String, RuleConfig>,

    /// Path-specific rule settings, in declaration order
    pub overrides: Vec<PathOverride>,
}

impl Config {
    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse configuration from JSON text
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Set or replace a global rule entry
    pub fn with_rule(mut self, rule_id: &str, rule: RuleConfig) -> Self {
        self.rules.insert(rule_id.to_string(), rule);
        self
    }

    /// Append a path override
    pub fn with_override(mut self, files: PathFilter, rules: &[(&str, RuleConfig)]) -> Self {
        self.overrides.push(PathOverride {
            files,
            rules: rules
                .iter()
                .map(|(id, cfg)| (id.to_string(), cfg.clone()))
                .collect(),
        });
        self
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.engine.max_passes = max_passes;
        self
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        // Engine settings - other takes precedence if non-default
        if other.engine.jobs != 0 {
            self.engine.jobs = other.engine.jobs;
        }
        self.engine.parallel = other.engine.parallel;
        self.engine.parallel_rules = other.engine.parallel_rules;
        if other.engine.max_passes != DEFAULT_MAX_PASSES {
            self.engine.max_passes = other.engine.max_passes;
        }

        // Files - extend lists
        self.files.include.extend(other.files.include);
        self.files.exclude.extend(other.files.exclude);

        // Rules - merge entries field by field
        for (rule_id, rule) in other.rules {
            self.rules.entry(rule_id).or_default().merge(&rule);
        }

        // Overrides keep declaration order, later configs last
        self.overrides.extend(other.overrides);
    }

    /// Number of worker threads for batch runs
    pub fn worker_count(&self) -> usize {
        if self.engine.jobs > 0 {
            self.engine.jobs
        } else {
            num_cpus::get()
        }
    }
}
