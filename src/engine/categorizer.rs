//! Rule matching and selection.
//!
//! For a given rule set and input the output is byte-for-byte reproducible:
//! candidates sort by vendor-qualification, then priority, then rule id.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{Category, LineItem, ProcessedItem};

use super::rules::{CompiledRule, RuleSet};

/// Confidence before the per-rule boost
pub const BASE_CONFIDENCE: f64 = 0.7;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Receipt-level context for matching one line item
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub vendor_name: &'a str,
    pub province: &'a str,
}

/// Deterministic categorization engine.
///
/// The rule set loads once at startup; `reload` swaps the whole set behind a
/// lock, so in-flight calls observe either the old rules or the new ones,
/// never a mixture.
pub struct RulesEngine {
    rules: RwLock<Arc<RuleSet>>,
}

impl RulesEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuleSet::default_rules())
    }

    /// Replace the rule set atomically
    pub fn reload(&self, rules: RuleSet) {
        *self.rules.write().expect("rules lock poisoned") = Arc::new(rules);
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().expect("rules lock poisoned").clone()
    }

    /// Categorize one line item.
    pub fn categorize_item(&self, item: &LineItem, ctx: &RuleContext<'_>) -> ProcessedItem {
        let rules = self.snapshot();
        let description = normalize(&item.description);
        let vendor = ctx.vendor_name.to_lowercase();

        let mut candidates: Vec<(bool, &CompiledRule)> = rules
            .rules
            .iter()
            .filter_map(|compiled| {
                let rule = &compiled.rule;

                let vendor_qualified = !compiled.vendor_globs.is_empty()
                    && compiled.vendor_globs.iter().any(|g| g.matches(&vendor));
                if !compiled.vendor_globs.is_empty() && !vendor_qualified {
                    return None;
                }

                if !rule.keywords.is_empty()
                    && !rule
                        .keywords
                        .iter()
                        .any(|k| description.contains(&k.to_lowercase()))
                {
                    return None;
                }

                if let Some(min) = rule.amount_min {
                    if item.total_price < min {
                        return None;
                    }
                }
                if let Some(max) = rule.amount_max {
                    if item.total_price > max {
                        return None;
                    }
                }

                if !rule.provinces.is_empty()
                    && !rule.provinces.iter().any(|p| p.eq_ignore_ascii_case(ctx.province))
                {
                    return None;
                }

                Some((vendor_qualified, compiled))
            })
            .collect();

        // Vendor-qualified first, then priority, then id for determinism
        candidates.sort_by(|(av, a), (bv, b)| {
            bv.cmp(av)
                .then(b.rule.priority.cmp(&a.rule.priority))
                .then(a.rule.id.cmp(&b.rule.id))
        });

        match candidates.first() {
            Some((_, compiled)) => {
                let rule = &compiled.rule;
                let confidence = (BASE_CONFIDENCE + rule.confidence_boost).clamp(0.0, 1.0);
                let reasoning = rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("matched rule '{}'", rule.id));
                ProcessedItem::new(
                    item.line_number,
                    item.description.clone(),
                    rule.category,
                    rule.deductibility_percent,
                    item.total_price,
                    reasoning,
                )
                .with_rule(rule.id.clone(), confidence)
            }
            None => ProcessedItem::new(
                item.line_number,
                item.description.clone(),
                Category::UncategorizedReviewRequired,
                0,
                item.total_price,
                "no matching rule",
            ),
        }
    }

    /// Categorize every line of a receipt in order
    pub fn categorize_all(&self, items: &[LineItem], ctx: &RuleContext<'_>) -> Vec<ProcessedItem> {
        items.iter().map(|item| self.categorize_item(item, ctx)).collect()
    }
}

fn normalize(description: &str) -> String {
    WHITESPACE
        .replace_all(description.trim(), " ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ctx<'a>(vendor: &'a str) -> RuleContext<'a> {
        RuleContext {
            vendor_name: vendor,
            province: "BC",
        }
    }

    #[test]
    fn test_vendor_rule_outranks_keyword_rule() {
        // "marketing fee" alone is Professional-Services, but on a Marriott
        // folio the hotel-vendor rule wins
        let engine = RulesEngine::with_defaults();
        let item = LineItem::new(1, "Marketing fee", dec("5.25"));

        let processed = engine.categorize_item(&item, &ctx("Marriott Downtown Vancouver"));
        assert_eq!(processed.category, Category::TravelLodging);
        assert_eq!(processed.deductibility_percent, 100);
        assert_eq!(processed.rule_id.as_deref(), Some("hotel-vendor-lodging"));

        let processed = engine.categorize_item(&item, &ctx("Acme Consulting"));
        assert_eq!(processed.category, Category::ProfessionalServices);
        assert_eq!(processed.rule_id.as_deref(), Some("keyword-professional"));
    }

    #[test]
    fn test_hotel_restaurant_charge_is_travel_meals() {
        let engine = RulesEngine::with_defaults();
        let item = LineItem::new(2, "Restaurant room charge", dec("40.70"));
        let processed = engine.categorize_item(&item, &ctx("Fairmont Banff Springs"));
        assert_eq!(processed.category, Category::TravelMeals);
        assert_eq!(processed.deductibility_percent, 50);
    }

    #[test]
    fn test_no_match_is_uncategorized_zero() {
        let engine = RulesEngine::with_defaults();
        let item = LineItem::new(1, "Business suit", dec("800.00"));
        let processed = engine.categorize_item(&item, &ctx("Harrods"));
        assert_eq!(processed.category, Category::UncategorizedReviewRequired);
        assert_eq!(processed.deductibility_percent, 0);
        assert_eq!(processed.confidence, 0.0);
        assert_eq!(processed.reasoning, "no matching rule");
        assert!(processed.rule_id.is_none());
    }

    #[test]
    fn test_deterministic_tie_break_by_id() {
        let toml = r#"
            [[rules]]
            id = "b-rule"
            priority = 10
            keywords = ["widget"]
            category = "Office-Supplies"
            deductibility_percent = 100

            [[rules]]
            id = "a-rule"
            priority = 10
            keywords = ["widget"]
            category = "Capital-Equipment"
            deductibility_percent = 100
        "#;
        let engine = RulesEngine::new(RuleSet::from_toml_str(toml).unwrap());
        let item = LineItem::new(1, "widget", dec("10.00"));
        let processed = engine.categorize_item(&item, &ctx("Anyone"));
        assert_eq!(processed.rule_id.as_deref(), Some("a-rule"));
        assert_eq!(processed.category, Category::CapitalEquipment);
    }

    #[test]
    fn test_province_whitelist_filters() {
        let toml = r#"
            [[rules]]
            id = "bc-levy"
            priority = 10
            keywords = ["levy"]
            provinces = ["BC"]
            category = "Travel-Taxes"
            deductibility_percent = 100
        "#;
        let engine = RulesEngine::new(RuleSet::from_toml_str(toml).unwrap());
        let item = LineItem::new(1, "tourism levy", dec("7.21"));

        let in_bc = engine.categorize_item(
            &item,
            &RuleContext {
                vendor_name: "Hotel X",
                province: "BC",
            },
        );
        assert_eq!(in_bc.category, Category::TravelTaxes);

        let in_on = engine.categorize_item(
            &item,
            &RuleContext {
                vendor_name: "Hotel X",
                province: "ON",
            },
        );
        assert_eq!(in_on.category, Category::UncategorizedReviewRequired);
    }

    #[test]
    fn test_amount_range_filters() {
        let toml = r#"
            [[rules]]
            id = "small-supplies"
            priority = 10
            keywords = ["adapter"]
            amount_max = 100.0
            category = "Office-Supplies"
            deductibility_percent = 100
        "#;
        let engine = RulesEngine::new(RuleSet::from_toml_str(toml).unwrap());

        let small = LineItem::new(1, "usb adapter", dec("19.99"));
        assert_eq!(
            engine.categorize_item(&small, &ctx("Shop")).category,
            Category::OfficeSupplies
        );

        let large = LineItem::new(1, "usb adapter", dec("250.00"));
        assert_eq!(
            engine.categorize_item(&large, &ctx("Shop")).category,
            Category::UncategorizedReviewRequired
        );
    }

    #[test]
    fn test_reload_swaps_atomically() {
        let engine = RulesEngine::with_defaults();
        let item = LineItem::new(1, "fuel", dec("60.00"));
        assert_eq!(
            engine.categorize_item(&item, &ctx("Petro-Canada")).category,
            Category::FuelVehicle
        );

        let toml = r#"
            [[rules]]
            id = "only-office"
            priority = 10
            keywords = ["fuel"]
            category = "Office-Supplies"
            deductibility_percent = 100
        "#;
        engine.reload(RuleSet::from_toml_str(toml).unwrap());
        assert_eq!(
            engine.categorize_item(&item, &ctx("Petro-Canada")).category,
            Category::OfficeSupplies
        );
    }

    #[test]
    fn test_confidence_is_base_plus_boost_clamped() {
        let toml = r#"
            [[rules]]
            id = "boosted"
            priority = 10
            keywords = ["thing"]
            category = "Office-Supplies"
            deductibility_percent = 100
            confidence_boost = 0.9
        "#;
        let engine = RulesEngine::new(RuleSet::from_toml_str(toml).unwrap());
        let item = LineItem::new(1, "thing", dec("5.00"));
        let processed = engine.categorize_item(&item, &ctx("Shop"));
        assert_eq!(processed.confidence, 1.0);
    }
}
