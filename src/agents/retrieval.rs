//! Retrieval augmentation over the tax-guide corpus.
//!
//! The search library itself is an external collaborator; this module owns
//! the query construction, the coarse expense-type hint mapping and the
//! ranked result shape. Citation identifiers are opaque values, never parsed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Result;

/// Results retained per line item
pub const TOP_K: usize = 3;

/// One ranked passage from the reference corpus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResult {
    /// Opaque identifier naming the passage
    pub citation_id: String,
    pub source_url: String,
    pub excerpt: String,
}

/// Black-box search over authoritative tax-guide passages
#[async_trait]
pub trait TaxGuideSearch: Send + Sync {
    /// Return up to `top_k` passages ranked by relevance
    async fn search(
        &self,
        query: &str,
        expense_hint: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RagResult>>;
}

/// Build the per-line retrieval query
pub fn line_query(description: &str, vendor: &str) -> String {
    format!("{} {} tax deduction rules", description, vendor)
}

/// Closed mapping from description cues to a coarse expense-type hint
pub fn expense_hint(description: &str) -> Option<&'static str> {
    let lower = description.to_lowercase();
    const MAPPING: [(&[&str], &str); 6] = [
        (&["gst", "hst", "tax", "levy"], "taxes"),
        (&["meal", "restaurant", "dining", "lunch", "dinner", "coffee"], "meals"),
        (&["room", "night", "lodging", "hotel", "suite"], "lodging"),
        (&["fuel", "gas", "diesel", "mileage"], "vehicle"),
        (&["consulting", "legal", "accounting", "fee"], "services"),
        (&["paper", "toner", "supplies", "ink"], "supplies"),
    ];
    MAPPING
        .iter()
        .find(|(cues, _)| cues.iter().any(|cue| lower.contains(cue)))
        .map(|(_, hint)| *hint)
}

/// Search backed by a JSON-over-HTTP retrieval service
pub struct HttpTaxGuideSearch {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTaxGuideSearch {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[derive(serde::Deserialize)]
struct SearchResponse {
    results: Vec<RagResult>,
}

#[async_trait]
impl TaxGuideSearch for HttpTaxGuideSearch {
    async fn search(
        &self,
        query: &str,
        expense_hint: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RagResult>> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "query": query,
                "expense_type": expense_hint,
                "top_k": top_k,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::domain::ExpenseOpsError::upstream(format!(
                "retrieval service returned {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.results.into_iter().take(top_k).collect())
    }
}

/// Search that finds nothing; used when no corpus is configured
pub struct NullSearch;

#[async_trait]
impl TaxGuideSearch for NullSearch {
    async fn search(
        &self,
        _query: &str,
        _expense_hint: Option<&str>,
        _top_k: usize,
    ) -> Result<Vec<RagResult>> {
        Ok(Vec::new())
    }
}
