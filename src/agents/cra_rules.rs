//! CRA-rules stage: retrieval-augmented categorization of extracted line
//! items, followed by deterministic post-processing.
//!
//! The model only assigns categories, percentages and reasoning. Amount
//! computation and citation injection happen after the call, in code, so
//! they hold regardless of model behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Category, ExpenseOpsError, LineItem, ProcessedItem, Receipt, Result};
use crate::observability::CorrelationId;
use crate::ratelimit::RateLimiter;

use super::llm::TextModel;
use super::retrieval::{expense_hint, line_query, RagResult, TaxGuideSearch, TOP_K};
use super::{run_stage, strip_code_fences, StageResult};

static GST_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)gst|hst|tax").expect("gst regex"));
static TIP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tip|gratuity").expect("tip regex"));

const JSON_ONLY_REINFORCEMENT: &str =
    "Your previous response was not valid JSON. Return ONLY the JSON object, with no prose and no code fences.";

/// Deterministic pre-pass: receipts often carry GST and tip only in the
/// summary block. Synthesize them as first-class line items so the model and
/// the post-processor see them.
pub fn synthesize_implicit_lines(receipt: &Receipt) -> Receipt {
    let mut out = receipt.clone();
    let mut next_line = out.max_line_number() + 1;

    if out.tax_amount > rust_decimal::Decimal::ZERO
        && !out.line_items.iter().any(|i| GST_LINE.is_match(&i.description))
    {
        out.line_items
            .push(LineItem::new(next_line, "GST/HST", out.tax_amount));
        next_line += 1;
    }

    if out.tip_amount > rust_decimal::Decimal::ZERO
        && !out.line_items.iter().any(|i| TIP_LINE.is_match(&i.description))
    {
        out.line_items.push(LineItem::new(next_line, "Tip", out.tip_amount));
    }

    out
}

#[derive(Debug, Deserialize)]
struct ModelOutput {
    processed_items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    line_number: u32,
    category: String,
    deductibility_percent: i64,
    #[serde(default)]
    reasoning: String,
}

/// Text LLM call with retrieval augmentation and deterministic post-processing
pub struct CraRulesStage {
    model: Arc<dyn TextModel>,
    search: Arc<dyn TaxGuideSearch>,
    limiter: Option<Arc<RateLimiter>>,
    timeout: Duration,
}

impl CraRulesStage {
    pub fn new(
        model: Arc<dyn TextModel>,
        search: Arc<dyn TaxGuideSearch>,
        limiter: Option<Arc<RateLimiter>>,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            search,
            limiter,
            timeout,
        }
    }

    /// Categorize every line of the receipt.
    ///
    /// The caller is expected to have run [`synthesize_implicit_lines`]
    /// already.
    pub async fn run(
        &self,
        receipt: &Receipt,
        correlation_id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<StageResult<Vec<ProcessedItem>>> {
        run_stage(
            "cra_rules",
            self.timeout,
            cancel,
            self.run_inner(receipt, correlation_id),
        )
        .await
    }

    async fn run_inner(
        &self,
        receipt: &Receipt,
        correlation_id: &CorrelationId,
    ) -> Result<StageResult<Vec<ProcessedItem>>> {
        let retrieved = self.retrieve(receipt).await?;
        let prompt = build_prompt(receipt, &retrieved);

        let mut last_parse_error = String::new();
        for attempt in 0..2 {
            let prompt = if attempt == 0 {
                prompt.clone()
            } else {
                format!("{}\n\n{}", prompt, JSON_ONLY_REINFORCEMENT)
            };

            if let Some(limiter) = &self.limiter {
                limiter.check_and_wait(correlation_id).await?;
            }

            let response = self.model.generate(&prompt).await?;
            match serde_json::from_str::<ModelOutput>(strip_code_fences(&response)) {
                Ok(output) => {
                    return Ok(post_process(receipt, output, &retrieved));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "categorization response unusable");
                    last_parse_error = e.to_string();
                }
            }
        }

        Err(ExpenseOpsError::CategorizationFailed(format!(
            "text model returned invalid JSON twice: {}",
            last_parse_error
        )))
    }

    /// Top-k passages per line, keyed by line number
    async fn retrieve(&self, receipt: &Receipt) -> Result<HashMap<u32, Vec<RagResult>>> {
        let mut by_line = HashMap::with_capacity(receipt.line_items.len());
        for item in &receipt.line_items {
            let query = line_query(&item.description, &receipt.vendor_name);
            let hint = expense_hint(&item.description);
            let results = self.search.search(&query, hint, TOP_K).await?;
            debug!(
                line = item.line_number,
                results = results.len(),
                "retrieval complete"
            );
            by_line.insert(item.line_number, results);
        }
        Ok(by_line)
    }
}

fn build_prompt(receipt: &Receipt, retrieved: &HashMap<u32, Vec<RagResult>>) -> String {
    let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();

    let mut lines = String::new();
    for item in &receipt.line_items {
        lines.push_str(&format!(
            "  {{\"line_number\": {}, \"description\": {:?}, \"total_price\": \"{}\"}}\n",
            item.line_number, item.description, item.total_price
        ));
    }

    let mut excerpts = String::new();
    let mut line_numbers: Vec<&u32> = retrieved.keys().collect();
    line_numbers.sort();
    for line_number in line_numbers {
        for result in &retrieved[line_number] {
            excerpts.push_str(&format!(
                "- [{}] {} ({})\n",
                result.citation_id, result.excerpt, result.source_url
            ));
        }
    }
    if excerpts.is_empty() {
        excerpts.push_str("(no reference passages available)\n");
    }

    format!(
        r#"You are a Canadian (CRA) small-business tax assistant.
Vendor: {vendor}
Province context applies to provincial levies.

Line items:
{lines}
Allowed categories (use these exact strings):
{categories}

Reference passages from the CRA tax guides:
{excerpts}
For EVERY line item, assign a category from the allowed list and a
deductibility percentage between 0 and 100 that CRA rules support
(meals and entertainment are limited to 50%). Respond with a JSON object:
{{"processed_items":[{{"line_number":N,"category":"...","deductibility_percent":P,"reasoning":"..."}}]}}
Respond with the JSON object only."#,
        vendor = receipt.vendor_name,
        lines = lines,
        categories = categories.join(", "),
        excerpts = excerpts,
    )
}

/// Deterministic post-processing: validate categories, fill gaps, compute
/// amounts, inject citations.
fn post_process(
    receipt: &Receipt,
    output: ModelOutput,
    retrieved: &HashMap<u32, Vec<RagResult>>,
) -> StageResult<Vec<ProcessedItem>> {
    let by_line: HashMap<u32, RawItem> = output
        .processed_items
        .into_iter()
        .map(|raw| (raw.line_number, raw))
        .collect();

    // Union of every retrieved citation, for lines whose own retrieval came
    // back empty
    let mut all_citations: Vec<String> = Vec::new();
    let mut line_numbers: Vec<&u32> = retrieved.keys().collect();
    line_numbers.sort();
    for line_number in line_numbers {
        for result in &retrieved[line_number] {
            if !all_citations.contains(&result.citation_id) {
                all_citations.push(result.citation_id.clone());
            }
        }
    }

    let mut warnings = Vec::new();
    let mut items = Vec::with_capacity(receipt.line_items.len());

    for line in &receipt.line_items {
        let mut item = match by_line.get(&line.line_number) {
            None => {
                warnings.push(format!(
                    "line {} missing from model output",
                    line.line_number
                ));
                ProcessedItem::new(
                    line.line_number,
                    line.description.clone(),
                    Category::UncategorizedReviewRequired,
                    0,
                    line.total_price,
                    "no match in model output",
                )
            }
            Some(raw) => match validated_category(raw) {
                Ok((category, percent)) => ProcessedItem::new(
                    line.line_number,
                    line.description.clone(),
                    category,
                    percent,
                    line.total_price,
                    raw.reasoning.clone(),
                ),
                Err(detail) => {
                    warnings.push(format!("line {}: {}", line.line_number, detail));
                    ProcessedItem::new(
                        line.line_number,
                        line.description.clone(),
                        Category::UncategorizedReviewRequired,
                        0,
                        line.total_price,
                        format!("{} ({})", raw.reasoning, detail),
                    )
                }
            },
        };

        // Citation injection is guaranteed regardless of model behavior
        if item.category.is_tax_relevant() {
            let own = retrieved
                .get(&line.line_number)
                .map(|results| {
                    results
                        .iter()
                        .map(|r| r.citation_id.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            item.citations = if own.is_empty() { all_citations.clone() } else { own };
        }

        item.confidence = if item.needs_review() { 0.0 } else { 0.9 };
        items.push(item);
    }

    let confidence = if warnings.is_empty() { 1.0 } else { 0.7 };
    StageResult::degraded(items, confidence, warnings)
}

fn validated_category(raw: &RawItem) -> std::result::Result<(Category, u8), String> {
    let category = Category::parse(&raw.category)
        .ok_or_else(|| format!("model proposed illegal category '{}'", raw.category))?;
    if !(0..=100).contains(&raw.deductibility_percent) {
        return Err(format!(
            "deductibility_percent {} outside [0, 100]",
            raw.deductibility_percent
        ));
    }
    Ok((category, raw.deductibility_percent as u8))
}
