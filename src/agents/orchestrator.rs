//! Sequencing of the processing stages.
//!
//! READY -> EXTRACTING -> CATEGORIZING -> AGGREGATING -> DONE, aborting on
//! the first stage failure. Retries live inside stages; the orchestrator
//! never re-runs a stage, and stages run strictly sequentially.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{
    CategorizedReceipt, ExpenseOpsError, ProcessedItem, Receipt, Result, StageConfidences,
};
use crate::engine::{RuleContext, RulesEngine};
use crate::ingestion::FileProcessor;
use crate::integrations::QuickBooksClient;
use crate::observability::{AuditKind, AuditLogger, CorrelationId};

use super::cra_rules::{synthesize_implicit_lines, CraRulesStage};
use super::extraction::ExtractionStage;

/// Which categorization pathway the caller selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pathway {
    /// Vision extraction followed by the retrieval-augmented LLM stage
    Agents,
    /// Vision extraction followed by the deterministic rule engine
    Rules,
}

impl Pathway {
    fn as_str(&self) -> &'static str {
        match self {
            Pathway::Agents => "agents",
            Pathway::Rules => "rules",
        }
    }
}

/// Per-request options
pub struct ProcessOptions {
    pub pathway: Pathway,
    pub dry_run: bool,
    pub context: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub cancel: CancellationToken,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            pathway: Pathway::Agents,
            dry_run: false,
            context: None,
            correlation_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Owns a receipt from ingestion to persistence
pub struct Orchestrator {
    files: FileProcessor,
    extraction: ExtractionStage,
    cra: CraRulesStage,
    engine: Arc<RulesEngine>,
    accounting: Option<Arc<QuickBooksClient>>,
    audit: AuditLogger,
    province: String,
    fallback_to_rules: bool,
}

impl Orchestrator {
    pub fn new(
        files: FileProcessor,
        extraction: ExtractionStage,
        cra: CraRulesStage,
        engine: Arc<RulesEngine>,
        audit: AuditLogger,
        province: String,
    ) -> Self {
        Self {
            files,
            extraction,
            cra,
            engine,
            accounting: None,
            audit,
            province,
            fallback_to_rules: false,
        }
    }

    pub fn with_accounting(mut self, client: Arc<QuickBooksClient>) -> Self {
        self.accounting = Some(client);
        self
    }

    pub fn with_fallback_to_rules(mut self, fallback: bool) -> Self {
        self.fallback_to_rules = fallback;
        self
    }

    /// Process one receipt artifact end to end.
    pub async fn process(
        &self,
        content: Vec<u8>,
        opts: ProcessOptions,
    ) -> Result<CategorizedReceipt> {
        let correlation_id = opts.correlation_id.clone().unwrap_or_default();

        self.audit.emit(
            &correlation_id,
            AuditKind::ReceiptStart,
            json!({
                "bytes": content.len(),
                "pathway": opts.pathway.as_str(),
                "dry_run": opts.dry_run,
            }),
        );

        let result = self.process_inner(content, &correlation_id, &opts).await;
        match &result {
            Ok(out) => {
                self.audit.emit(
                    &correlation_id,
                    AuditKind::ReceiptDone,
                    json!({
                        "vendor": out.receipt.vendor_name,
                        "total_deductible": out.total_deductible.to_string(),
                        "overall_confidence": out.overall_confidence,
                        "flags_for_review": out.flags_for_review.len(),
                    }),
                );
            }
            Err(e) => {
                self.audit.emit(
                    &correlation_id,
                    AuditKind::ReceiptFailed,
                    json!({ "error": e.kind(), "detail": e.to_string() }),
                );
            }
        }
        result
    }

    async fn process_inner(
        &self,
        content: Vec<u8>,
        correlation_id: &CorrelationId,
        opts: &ProcessOptions,
    ) -> Result<CategorizedReceipt> {
        // EXTRACTING
        let image = self.files.process(content, correlation_id).await?;
        let extraction = self
            .extraction
            .run(&image, opts.context.as_deref(), correlation_id, &opts.cancel)
            .await?;
        self.audit.emit(
            correlation_id,
            AuditKind::StageComplete,
            json!({ "stage": "extraction", "confidence": extraction.confidence }),
        );

        let receipt = synthesize_implicit_lines(&extraction.value);

        // CATEGORIZING
        let (items, categorization_confidence, mut flags) = match opts.pathway {
            Pathway::Rules => self.run_rules_pathway(&receipt),
            Pathway::Agents => {
                match self.cra.run(&receipt, correlation_id, &opts.cancel).await {
                    Ok(stage) => (stage.value, stage.confidence, stage.warnings),
                    Err(ExpenseOpsError::Canceled) => return Err(ExpenseOpsError::Canceled),
                    Err(e) if self.fallback_to_rules => {
                        warn!(error = %e, "LLM pathway failed, falling back to rule engine");
                        let (items, confidence, mut warnings) = self.run_rules_pathway(&receipt);
                        warnings.push(format!("LLM pathway failed ({}), rule engine used", e.kind()));
                        (items, confidence, warnings)
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        self.audit.emit(
            correlation_id,
            AuditKind::StageComplete,
            json!({ "stage": "categorization", "confidence": categorization_confidence }),
        );

        // AGGREGATING
        flags.extend(extraction.warnings.iter().cloned());
        let confidences = StageConfidences {
            extraction: extraction.confidence,
            categorization: categorization_confidence,
        };
        let out = CategorizedReceipt::assemble(receipt, items, confidences, flags);
        info!(
            vendor = %out.receipt.vendor_name,
            total = %out.total_original,
            deductible = %out.total_deductible,
            "receipt categorized"
        );

        // DONE: hand off to accounting unless this is a dry run. Once the
        // purchase POST starts it runs to completion regardless of
        // cancellation, so no orphaned write can occur.
        if !opts.dry_run {
            if let Some(accounting) = &self.accounting {
                let purchase = accounting.create_purchase(&out, correlation_id).await?;
                self.audit.emit(
                    correlation_id,
                    AuditKind::PurchaseCreated,
                    json!({ "purchase_id": purchase.id, "total": purchase.total.to_string() }),
                );
            }
        }

        Ok(out)
    }

    fn run_rules_pathway(&self, receipt: &Receipt) -> (Vec<ProcessedItem>, f64, Vec<String>) {
        let ctx = RuleContext {
            vendor_name: &receipt.vendor_name,
            province: &self.province,
        };
        let items = self.engine.categorize_all(&receipt.line_items, &ctx);
        let confidence = if items.is_empty() {
            1.0
        } else {
            items.iter().map(|i| i.confidence).sum::<f64>() / items.len() as f64
        };
        (items, confidence, Vec::new())
    }
}
