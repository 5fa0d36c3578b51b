//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgb};
use rust_decimal::Decimal;

use expense_ops::agents::{
    CraRulesStage, ExtractionStage, Orchestrator, RagResult, TaxGuideSearch, TextModel,
    VisionModel, VisionRequest,
};
use expense_ops::domain::Result;
use expense_ops::engine::RulesEngine;
use expense_ops::ingestion::FileProcessor;
use expense_ops::observability::AuditLogger;

pub fn dec(s: &str) -> Decimal {
    use std::str::FromStr;
    Decimal::from_str(s).unwrap()
}

/// A decodable PNG receipt artifact
pub fn png_artifact() -> Vec<u8> {
    let buf: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_pixel(400, 600, Rgb([235u8, 235, 230]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(buf)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Vision model that replays scripted responses in order
pub struct ScriptedVision {
    responses: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    async fn generate(&self, _request: VisionRequest<'_>) -> Result<String> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .responses
            .get(i)
            .cloned()
            .unwrap_or_else(|| self.responses.last().cloned().unwrap_or_default()))
    }
}

/// Text model that replays scripted responses in order
pub struct ScriptedText {
    responses: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedText {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TextModel for ScriptedText {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .responses
            .get(i)
            .cloned()
            .unwrap_or_else(|| self.responses.last().cloned().unwrap_or_default()))
    }
}

/// Search returning a fixed result list
pub struct StaticSearch {
    pub results: Vec<RagResult>,
}

impl StaticSearch {
    pub fn with_cra_passages() -> Self {
        Self {
            results: vec![
                RagResult {
                    citation_id: "IT-518R-p4".to_string(),
                    source_url: "https://cra.example/it518r".to_string(),
                    excerpt: "Meals and entertainment are 50% deductible".to_string(),
                },
                RagResult {
                    citation_id: "T4002-ch3".to_string(),
                    source_url: "https://cra.example/t4002".to_string(),
                    excerpt: "GST/HST input tax credits".to_string(),
                },
            ],
        }
    }
}

#[async_trait]
impl TaxGuideSearch for StaticSearch {
    async fn search(
        &self,
        _query: &str,
        _hint: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RagResult>> {
        Ok(self.results.iter().take(top_k).cloned().collect())
    }
}

/// Orchestrator wired with scripted models, no accounting client
pub fn orchestrator(
    vision: ScriptedVision,
    text: ScriptedText,
    search: Arc<dyn TaxGuideSearch>,
) -> Orchestrator {
    let audit = AuditLogger::disabled();
    Orchestrator::new(
        FileProcessor::new(audit.clone()),
        ExtractionStage::new(Arc::new(vision), None, Duration::from_secs(30)),
        CraRulesStage::new(Arc::new(text), search, None, Duration::from_secs(30)),
        Arc::new(RulesEngine::with_defaults()),
        audit,
        "BC".to_string(),
    )
}
