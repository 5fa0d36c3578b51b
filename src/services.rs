//! Process-wide service registry.
//!
//! The token manager, rate limiters and caches are singletons per process
//! and key. They are constructed once here and injected explicitly; nothing
//! in the crate reaches for global state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agents::{
    CraRulesStage, ExtractionStage, HttpTaxGuideSearch, HttpTextModel, HttpVisionModel,
    NullSearch, Orchestrator, TaxGuideSearch,
};
use crate::auth::{OAuthManager, TokenStore};
use crate::batch::BatchDriver;
use crate::config::Config;
use crate::domain::Result;
use crate::engine::{RuleSet, RulesEngine};
use crate::ingestion::FileProcessor;
use crate::integrations::QuickBooksClient;
use crate::observability::{AuditLogger, AuditWriter};
use crate::ratelimit::{RateLimiter, RateLimiterRegistry};

/// Everything a front-end needs, wired once at startup
pub struct Services {
    pub config: Config,
    pub audit: AuditLogger,
    pub audit_task: JoinHandle<()>,
    pub oauth: Arc<OAuthManager>,
    pub quickbooks: Arc<QuickBooksClient>,
    pub orchestrator: Arc<Orchestrator>,
    pub limiters: RateLimiterRegistry,
}

impl Services {
    /// Build the full registry from configuration. Must run inside a tokio
    /// runtime (the audit writer task is spawned here).
    pub fn from_config(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let (audit, audit_task) =
            AuditWriter::spawn(config.audit_dir(), config.sensitive_keys.clone());

        let oauth = Arc::new(OAuthManager::new(
            TokenStore::new(config.tokens_path()),
            config.quickbooks.clone(),
            audit.clone(),
        ));

        let mut limiters = RateLimiterRegistry::new();
        for provider in [&config.vision, &config.text] {
            limiters.insert(RateLimiter::new(
                config.data_dir.clone(),
                provider.name.clone(),
                provider.requests_per_minute,
                provider.requests_per_day,
                audit.clone(),
            ));
        }

        let extraction = ExtractionStage::new(
            Arc::new(HttpVisionModel::new(config.vision.clone())),
            limiters.get(&config.vision.name),
            Duration::from_secs(config.vision.timeout_secs),
        );

        let search: Arc<dyn TaxGuideSearch> = match &config.retrieval {
            Some(retrieval) => Arc::new(HttpTaxGuideSearch::new(retrieval.endpoint.clone())),
            None => Arc::new(NullSearch),
        };
        let cra = CraRulesStage::new(
            Arc::new(HttpTextModel::new(config.text.clone())),
            search,
            limiters.get(&config.text.name),
            Duration::from_secs(config.text.timeout_secs),
        );

        let rules = match &config.rules_path {
            Some(path) => RuleSet::from_file(path)?,
            None => RuleSet::default_rules(),
        };
        let engine = Arc::new(RulesEngine::new(rules));

        let quickbooks = Arc::new(QuickBooksClient::new(
            oauth.clone(),
            config.quickbooks.base_url.clone(),
        ));

        let orchestrator = Arc::new(
            Orchestrator::new(
                FileProcessor::new(audit.clone()),
                extraction,
                cra,
                engine,
                audit.clone(),
                config.province.clone(),
            )
            .with_accounting(quickbooks.clone())
            .with_fallback_to_rules(config.fallback_to_rules),
        );

        Ok(Self {
            config,
            audit,
            audit_task,
            oauth,
            quickbooks,
            orchestrator,
            limiters,
        })
    }

    /// Batch driver over this registry's orchestrator
    pub fn batch_driver(&self) -> BatchDriver {
        BatchDriver::new(
            self.orchestrator.clone(),
            self.audit.clone(),
            self.config.audit_dir(),
        )
    }

    /// Drain the audit channel before exit
    pub async fn shutdown(self) {
        let Services {
            audit, audit_task, ..
        } = self;
        audit.flush().await;
        // Remaining senders died with the registry; the writer loop exits
        drop(audit);
        let _ = audit_task.await;
    }
}
