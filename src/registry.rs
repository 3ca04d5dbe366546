//! Rule registry and configuration resolution

use crate::config::{Config, ConfigError, RuleConfig};
use crate::diagnostic::Severity;
use crate::rule::Rule;
use crate::tree::PARSE_ERROR_RULE;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A rule as it will run for one document
#[derive(Clone)]
pub struct ActiveRule {
    pub rule: Arc<dyn Rule>,
    pub severity: Severity,
    pub options: Value,
}

impl ActiveRule {
    pub fn id(&self) -> &str {
        self.rule.id()
    }
}

impl std::fmt::Debug for ActiveRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRule")
            .field("id", &self.rule.id())
            .field("severity", &self.severity)
            .field("options", &self.options)
            .finish()
    }
}

/// The enabled rules for one path, in registration order
#[derive(Debug, Clone, Default)]
pub struct ActiveRuleSet {
    rules: Vec<ActiveRule>,
}

impl ActiveRuleSet {
    pub fn new(rules: Vec<ActiveRule>) -> Self {
        Self { rules }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ActiveRule> {
        self.rules.iter()
    }

    pub fn as_slice(&self) -> &[ActiveRule] {
        &self.rules
    }

    pub fn get(&self, rule_id: &str) -> Option<&ActiveRule> {
        self.rules.iter().find(|r| r.id() == rule_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Working state of one rule while layering configuration
struct Resolution {
    enabled: bool,
    severity: Severity,
    options: Value,
}

/// All known rules, keyed by id
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
    index: HashMap<String, usize>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; ids must be unique and must not be `parse-error`
    pub fn register(&mut self, rule: Arc<dyn Rule>) -> Result<(), ConfigError> {
        let id = rule.id().to_string();
        if id == PARSE_ERROR_RULE {
            return Err(ConfigError::ReservedRule(id));
        }
        if self.index.contains_key(&id) {
            return Err(ConfigError::DuplicateRule(id));
        }
        log::trace!("registering rule {}", id);
        self.index.insert(id, self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Register several rules, stopping at the first duplicate
    pub fn register_all(
        &mut self,
        rules: impl IntoIterator<Item = Arc<dyn Rule>>,
    ) -> Result<(), ConfigError> {
        for rule in rules {
            self.register(rule)?;
        }
        Ok(())
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<dyn Rule>> {
        self.index.get(rule_id).map(|&idx| &self.rules[idx])
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.index.contains_key(rule_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Rule>> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check every entry of a configuration against the registry
    ///
    /// Global entries and every path override are checked, matched or not, so
    /// a broken configuration is rejected before any document is evaluated.
    pub fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        config.files.compile()?;
        self.validate_entries(&config.rules, "rules")?;

        for (idx, path_override) in config.overrides.iter().enumerate() {
            path_override.files.compile()?;
            self.validate_entries(&path_override.rules, &format!("overrides[{}]", idx))?;
        }

        Ok(())
    }

    fn validate_entries<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a String, &'a RuleConfig)>,
        scope: &str,
    ) -> Result<(), ConfigError> {
        for (rule_id, entry) in entries {
            let rule = self.get(rule_id).ok_or_else(|| ConfigError::UnknownRule {
                rule_id: rule_id.clone(),
                scope: scope.to_string(),
            })?;

            if let Some(token) = &entry.severity {
                parse_severity(rule_id, token)?;
            }

            if !entry.options.is_null() {
                rule.validate_options(&entry.options)
                    .map_err(|message| ConfigError::InvalidOptions {
                        rule_id: rule_id.clone(),
                        message,
                    })?;
            }
        }
        Ok(())
    }

    /// Resolve the active rule set for one path
    ///
    /// Layering order: rule defaults, global entries, then matching path
    /// overrides from least to most specific (ties: later declaration wins).
    /// A path rejected by the global file filter gets an empty set.
    pub fn resolve(&self, config: &Config, path: &Path) -> Result<ActiveRuleSet, ConfigError> {
        self.validate(config)?;

        if !config.files.compile()?.is_match(path) {
            log::debug!("{} excluded by file filter", path.display());
            return Ok(ActiveRuleSet::default());
        }

        let mut state: Vec<Resolution> = self
            .rules
            .iter()
            .map(|rule| Resolution {
                enabled: rule.enabled_by_default(),
                severity: rule.default_severity(),
                options: Value::Null,
            })
            .collect();

        for (rule_id, entry) in &config.rules {
            self.apply_entry(&mut state, rule_id, entry)?;
        }

        let mut matching = Vec::new();
        for (idx, path_override) in config.overrides.iter().enumerate() {
            if let Some(specificity) = path_override.files.compile()?.match_specificity(path) {
                matching.push((specificity, idx));
            }
        }
        // Stable: equal specificity keeps declaration order, so later wins.
        matching.sort_by_key(|&(specificity, _)| specificity);

        for (_, idx) in matching {
            for (rule_id, entry) in &config.overrides[idx].rules {
                self.apply_entry(&mut state, rule_id, entry)?;
            }
        }

        let active = self
            .rules
            .iter()
            .zip(state)
            .filter(|(_, res)| res.enabled)
            .map(|(rule, res)| ActiveRule {
                rule: Arc::clone(rule),
                severity: res.severity,
                options: res.options,
            })
            .collect();

        Ok(ActiveRuleSet::new(active))
    }

    fn apply_entry(
        &self,
        state: &mut [Resolution],
        rule_id: &str,
        entry: &RuleConfig,
    ) -> Result<(), ConfigError> {
        let idx = *self
            .index
            .get(rule_id)
            .ok_or_else(|| ConfigError::UnknownRule {
                rule_id: rule_id.to_string(),
                scope: "rules".to_string(),
            })?;
        let res = &mut state[idx];

        if let Some(enabled) = entry.enabled {
            res.enabled = enabled;
        }
        if let Some(token) = &entry.severity {
            res.severity = parse_severity(rule_id, token)?;
        }
        if !entry.options.is_null() {
            res.options = entry.options.clone();
        }
        Ok(())
    }
}

fn parse_severity(rule_id: &str, token: &str) -> Result<Severity, ConfigError> {
    token
        .parse::<Severity>()
        .map_err(|_| ConfigError::InvalidSeverity {
            rule_id: rule_id.to_string(),
            token: token.to_string(),
        })
}
