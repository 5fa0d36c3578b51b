//! expense-ops - Receipt processing and CRA expense categorization
//!
//! This library ingests receipt artifacts (images or PDFs), extracts
//! structured line items with a vision language model, applies Canadian
//! (CRA) deduction rules with retrieval augmentation, and writes normalized
//! expense records to QuickBooks Online.

pub mod agents;
pub mod api;
pub mod auth;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod ingestion;
pub mod integrations;
pub mod observability;
pub mod ratelimit;
pub mod services;

// Re-export commonly used types
pub use domain::{
    CategorizedReceipt, Category, ExpenseOpsError, LineItem, ProcessedItem, Receipt, Result,
    StageConfidences,
};

pub use agents::{
    CraRulesStage, ExtractionStage, Orchestrator, Pathway, ProcessOptions, RagResult,
    TaxGuideSearch, TextModel, VisionModel,
};

pub use auth::{AuthStatus, OAuthManager, TokenBundle, TokenStore};

pub use batch::{BatchDriver, BatchOptions, BatchOutcome, BatchProgress};

pub use cache::TtlCache;

pub use config::Config;

pub use engine::{RuleSet, RulesEngine};

pub use ingestion::{CanonicalImage, FileProcessor, SourceKind};

pub use integrations::QuickBooksClient;

pub use observability::{AuditEvent, AuditKind, AuditLogger, CorrelationId};

pub use ratelimit::{RateLimiter, RateLimiterRegistry};

pub use services::Services;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
