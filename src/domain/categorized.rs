use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::category::Category;
use super::money::{deductibility_rate, deductible_amount, round2};
use super::receipt::Receipt;

/// One line item after categorization. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedItem {
    /// Source line number from the extracted receipt
    pub line_number: u32,

    pub description: String,

    pub category: Category,

    /// 0-100; the rule-engine pathway only ever emits 0, 50 or 100
    pub deductibility_percent: u8,

    pub original_amount: Decimal,

    pub deductible_amount: Decimal,

    pub reasoning: String,

    /// Opaque citation identifiers, injected deterministically after the LLM call
    #[serde(default)]
    pub citations: Vec<String>,

    /// Rule that matched, rule-engine pathway only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,

    /// Match confidence in [0, 1]
    pub confidence: f64,
}

impl ProcessedItem {
    /// Build an item with the deductible amount computed from the original
    /// amount and percentage, half-up at two decimals.
    pub fn new(
        line_number: u32,
        description: impl Into<String>,
        category: Category,
        deductibility_percent: u8,
        original_amount: Decimal,
        reasoning: impl Into<String>,
    ) -> Self {
        let original_amount = round2(original_amount);
        Self {
            line_number,
            description: description.into(),
            category,
            deductibility_percent,
            original_amount,
            deductible_amount: deductible_amount(original_amount, deductibility_percent),
            reasoning: reasoning.into(),
            citations: Vec::new(),
            rule_id: None,
            confidence: 0.0,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>, confidence: f64) -> Self {
        self.rule_id = Some(rule_id.into());
        self.confidence = confidence;
        self
    }

    pub fn needs_review(&self) -> bool {
        self.category == Category::UncategorizedReviewRequired
    }
}

/// Per-stage confidence scores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfidences {
    pub extraction: f64,
    pub categorization: f64,
}

impl StageConfidences {
    pub fn overall(&self) -> f64 {
        (self.extraction + self.categorization) / 2.0
    }
}

/// Final record emitted by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizedReceipt {
    pub receipt: Receipt,

    pub items: Vec<ProcessedItem>,

    pub total_original: Decimal,

    pub total_deductible: Decimal,

    /// 100 * deductible / original, one decimal place
    pub deductibility_rate: Decimal,

    pub confidences: StageConfidences,

    pub overall_confidence: f64,

    /// Non-empty when anything needs a human look
    #[serde(default)]
    pub flags_for_review: Vec<String>,
}

impl CategorizedReceipt {
    /// Assemble the aggregate from the receipt, its processed items and the
    /// stage confidences. Review flags for uncategorized items and low stage
    /// confidence are appended to the provided warnings.
    pub fn assemble(
        receipt: Receipt,
        items: Vec<ProcessedItem>,
        confidences: StageConfidences,
        mut flags_for_review: Vec<String>,
    ) -> Self {
        let total_original = round2(items.iter().map(|i| i.original_amount).sum());
        let total_deductible = round2(items.iter().map(|i| i.deductible_amount).sum());

        for item in items.iter().filter(|i| i.needs_review()) {
            flags_for_review.push(format!(
                "line {} '{}' requires manual review",
                item.line_number, item.description
            ));
        }
        if confidences.extraction < 0.85 {
            flags_for_review.push(format!(
                "extraction confidence {:.2} below threshold",
                confidences.extraction
            ));
        }
        if confidences.categorization < 0.85 {
            flags_for_review.push(format!(
                "categorization confidence {:.2} below threshold",
                confidences.categorization
            ));
        }

        let overall_confidence = confidences.overall();
        Self {
            receipt,
            items,
            total_original,
            total_deductible,
            deductibility_rate: deductibility_rate(total_deductible, total_original),
            confidences,
            overall_confidence,
            flags_for_review,
        }
    }
}
