//! Deterministic rule-based categorization.

pub mod categorizer;
pub mod rules;

pub use categorizer::{RuleContext, RulesEngine, BASE_CONFIDENCE};
pub use rules::{Rule, RuleSet};
