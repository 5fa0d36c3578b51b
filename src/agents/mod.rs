//! Two-stage agent pipeline: vision extraction, CRA categorization, and the
//! orchestrator that sequences them.

pub mod cra_rules;
pub mod extraction;
pub mod llm;
pub mod orchestrator;
pub mod retrieval;

pub use cra_rules::{synthesize_implicit_lines, CraRulesStage};
pub use extraction::ExtractionStage;
pub use llm::{HttpTextModel, HttpVisionModel, TextModel, VisionModel, VisionRequest};
pub use orchestrator::{Orchestrator, Pathway, ProcessOptions};
pub use retrieval::{HttpTaxGuideSearch, NullSearch, RagResult, TaxGuideSearch};

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::{ExpenseOpsError, Result};

/// Outcome of one stage: a value plus the stage's self-reported confidence
#[derive(Debug, Clone)]
pub struct StageResult<T> {
    pub value: T,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

impl<T> StageResult<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            confidence: 1.0,
            warnings: Vec::new(),
        }
    }

    pub fn degraded(value: T, confidence: f64, warnings: Vec<String>) -> Self {
        Self {
            value,
            confidence,
            warnings,
        }
    }
}

/// Run a stage future under its hard deadline, honoring cancellation at the
/// suspension point. A canceled stage abandons its in-flight request; a
/// timed-out stage reports failure and the orchestrator aborts.
pub(crate) async fn run_stage<T>(
    stage: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ExpenseOpsError::Canceled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ExpenseOpsError::Timeout {
                stage: stage.to_string(),
                timeout,
            }),
        },
    }
}

/// Strip a Markdown code fence (``` or ```json) wrapping an LLM response.
pub(crate) fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```json\n{}\n```  "), "{}");
    }

    #[tokio::test]
    async fn test_run_stage_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<()> = run_stage(
            "extraction",
            Duration::from_millis(20),
            &cancel,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ExpenseOpsError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_stage_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = run_stage(
            "extraction",
            Duration::from_secs(30),
            &cancel,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ExpenseOpsError::Canceled)));
    }
}
