//! Rule configuration: loading, validation and compilation.

use std::collections::HashSet;
use std::path::Path;

use glob::Pattern;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{Category, ExpenseOpsError, Result};

/// Embedded default rule file, used when no `rules_path` is configured
const DEFAULT_RULES: &str = include_str!("../../rules/cra_rules.toml");

/// One categorization rule as declared in the rule file
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub id: String,

    /// Higher wins among rules of the same vendor-qualification
    pub priority: i32,

    /// Case-insensitive substrings matched against the normalized description
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Glob-style vendor patterns; a match makes the rule vendor-qualified
    #[serde(default)]
    pub vendor_patterns: Vec<String>,

    /// Inclusive bounds on the line total
    #[serde(default)]
    pub amount_min: Option<Decimal>,
    #[serde(default)]
    pub amount_max: Option<Decimal>,

    /// Province whitelist; empty means all provinces
    #[serde(default)]
    pub provinces: Vec<String>,

    pub category: Category,

    /// Must be 0, 50 or 100 on this pathway
    pub deductibility_percent: u8,

    /// QuickBooks account hint attached to matched items
    #[serde(default)]
    pub account_hint: Option<String>,

    /// Added to the base confidence, result clamped to [0, 1]
    #[serde(default)]
    pub confidence_boost: f64,

    /// Reasoning text emitted with matched items
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

/// A rule with its vendor patterns compiled
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub rule: Rule,
    pub vendor_globs: Vec<Pattern>,
}

/// Validated, immutable rule collection
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub(crate) rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Parse and validate a TOML rule document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(contents)
            .map_err(|e| ExpenseOpsError::RuleValidation(e.to_string()))?;
        Self::compile(file.rules)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// The embedded default rule file
    pub fn default_rules() -> Self {
        Self::from_toml_str(DEFAULT_RULES).expect("embedded rule file is valid")
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn compile(rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            if rule.id.is_empty() {
                return Err(ExpenseOpsError::RuleValidation(
                    "rule id must be non-empty".to_string(),
                ));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(ExpenseOpsError::RuleValidation(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
            if !matches!(rule.deductibility_percent, 0 | 50 | 100) {
                return Err(ExpenseOpsError::RuleValidation(format!(
                    "rule '{}': deductibility_percent must be 0, 50 or 100",
                    rule.id
                )));
            }
            if rule.keywords.is_empty() && rule.vendor_patterns.is_empty() {
                return Err(ExpenseOpsError::RuleValidation(format!(
                    "rule '{}' needs keywords or vendor_patterns",
                    rule.id
                )));
            }
            if !(0.0..=1.0).contains(&rule.confidence_boost) {
                return Err(ExpenseOpsError::RuleValidation(format!(
                    "rule '{}': confidence_boost outside [0, 1]",
                    rule.id
                )));
            }

            let vendor_globs = rule
                .vendor_patterns
                .iter()
                .map(|p| {
                    Pattern::new(&p.to_lowercase()).map_err(|e| {
                        ExpenseOpsError::RuleValidation(format!(
                            "rule '{}': bad vendor pattern '{}': {}",
                            rule.id, p, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            compiled.push(CompiledRule { rule, vendor_globs });
        }

        Ok(Self { rules: compiled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_load() {
        let rules = RuleSet::default_rules();
        assert!(!rules.is_empty());
    }

    #[test]
    fn test_unknown_category_rejected_at_load() {
        let toml = r#"
            [[rules]]
            id = "bad"
            priority = 1
            keywords = ["thing"]
            category = "Miscellaneous"
            deductibility_percent = 100
        "#;
        let err = RuleSet::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ExpenseOpsError::RuleValidation(_)));
    }

    #[test]
    fn test_percent_outside_closed_set_rejected() {
        let toml = r#"
            [[rules]]
            id = "bad-pct"
            priority = 1
            keywords = ["thing"]
            category = "Office-Supplies"
            deductibility_percent = 75
        "#;
        assert!(RuleSet::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let toml = r#"
            [[rules]]
            id = "dup"
            priority = 1
            keywords = ["a"]
            category = "Office-Supplies"
            deductibility_percent = 100

            [[rules]]
            id = "dup"
            priority = 2
            keywords = ["b"]
            category = "Office-Supplies"
            deductibility_percent = 100
        "#;
        assert!(RuleSet::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_conditionless_rule_rejected() {
        let toml = r#"
            [[rules]]
            id = "empty"
            priority = 1
            category = "Office-Supplies"
            deductibility_percent = 100
        "#;
        assert!(RuleSet::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_bad_glob_rejected() {
        let toml = r#"
            [[rules]]
            id = "bad-glob"
            priority = 1
            vendor_patterns = ["[unclosed"]
            category = "Office-Supplies"
            deductibility_percent = 100
        "#;
        assert!(RuleSet::from_toml_str(toml).is_err());
    }
}
