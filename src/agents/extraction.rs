//! Data-extraction stage: vision model reads the canonical image into a
//! structured [`Receipt`].

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{ExpenseOpsError, Receipt, Result};
use crate::ingestion::CanonicalImage;
use crate::observability::CorrelationId;
use crate::ratelimit::RateLimiter;

use super::llm::{VisionModel, VisionRequest};
use super::{run_stage, strip_code_fences, StageResult};

const EXTRACTION_PROMPT: &str = r#"You are reading a single receipt image.
Extract the receipt into a JSON object with exactly these fields:
  vendor_name (string), transaction_date (YYYY-MM-DD), currency (3-letter code, default "CAD"),
  subtotal (number), tax_amount (number), tip_amount (number), total_amount (number),
  payment_method (string or null),
  line_items: array of { line_number (1-based integer, no gaps), description (string),
                         quantity (number, default 1), unit_price (number), total_price (number) }.
Amounts use 2 decimal places. Respond with the JSON object only."#;

const JSON_ONLY_REINFORCEMENT: &str =
    "Your previous response was not valid JSON. Return ONLY the JSON object, with no prose and no code fences.";

/// Vision LLM call with schema-constrained output
pub struct ExtractionStage {
    model: Arc<dyn VisionModel>,
    limiter: Option<Arc<RateLimiter>>,
    timeout: Duration,
}

impl ExtractionStage {
    pub fn new(
        model: Arc<dyn VisionModel>,
        limiter: Option<Arc<RateLimiter>>,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            limiter,
            timeout,
        }
    }

    /// Extract a candidate receipt from the canonical image.
    pub async fn run(
        &self,
        image: &CanonicalImage,
        context: Option<&str>,
        correlation_id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<StageResult<Receipt>> {
        run_stage(
            "extraction",
            self.timeout,
            cancel,
            self.run_inner(image, context, correlation_id),
        )
        .await
    }

    async fn run_inner(
        &self,
        image: &CanonicalImage,
        context: Option<&str>,
        correlation_id: &CorrelationId,
    ) -> Result<StageResult<Receipt>> {
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
        let base_prompt = match context {
            Some(context) => format!("{}\n\nAdditional context from the user: {}", EXTRACTION_PROMPT, context),
            None => EXTRACTION_PROMPT.to_string(),
        };

        let mut last_parse_error = String::new();
        for attempt in 0..2 {
            let prompt = if attempt == 0 {
                base_prompt.clone()
            } else {
                format!("{}\n\n{}", base_prompt, JSON_ONLY_REINFORCEMENT)
            };

            if let Some(limiter) = &self.limiter {
                limiter.check_and_wait(correlation_id).await?;
            }

            let response = self
                .model
                .generate(VisionRequest {
                    prompt: &prompt,
                    image_base64: &image_base64,
                    mime: image.mime,
                })
                .await?;

            match parse_receipt(&response) {
                Ok((receipt, warnings)) => {
                    let confidence = if warnings.is_empty() { 1.0 } else { 0.7 };
                    debug!(
                        vendor = %receipt.vendor_name,
                        lines = receipt.line_items.len(),
                        confidence,
                        "extraction complete"
                    );
                    return Ok(StageResult::degraded(receipt, confidence, warnings));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "extraction response unusable");
                    last_parse_error = e;
                }
            }
        }

        Err(ExpenseOpsError::ExtractionFailed(format!(
            "vision model returned invalid receipt JSON twice: {}",
            last_parse_error
        )))
    }
}

fn parse_receipt(response: &str) -> std::result::Result<(Receipt, Vec<String>), String> {
    let body = strip_code_fences(response);
    let receipt: Receipt =
        serde_json::from_str(body).map_err(|e| format!("json parse: {}", e))?;
    let warnings = receipt.validate()?;
    Ok((receipt, warnings))
}
