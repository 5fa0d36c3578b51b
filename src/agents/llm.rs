//! Model endpoint clients.
//!
//! The stages talk to traits, not providers: tests plug in scripted models,
//! production wires HTTP-backed implementations built from [`ProviderConfig`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::domain::{ExpenseOpsError, Result};

/// Delay before the single transient-error retry
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One vision inference request
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub prompt: &'a str,
    /// Base64-encoded canonical image
    pub image_base64: &'a str,
    pub mime: &'a str,
}

/// Vision language model able to read a receipt image
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, request: VisionRequest<'_>) -> Result<String>;
}

/// Text language model used for categorization
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    output: String,
}

/// Shave up to 30% off the delay to avoid thundering-herd retries
fn add_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let jitter: f64 = rng.gen_range(0.0..=0.3);
    Duration::from_secs_f64(duration.as_secs_f64() * (1.0 - jitter))
}

/// Shared HTTP plumbing for both model kinds
struct ModelEndpoint {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl ModelEndpoint {
    fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn post_generate(&self, body: serde_json::Value) -> Result<String> {
        match self.post_once(&body).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_transient() => {
                warn!(provider = %self.config.name, error = %e, "transient model error, retrying");
                tokio::time::sleep(add_jitter(RETRY_DELAY)).await;
                self.post_once(&body).await
            }
            Err(e) => Err(e),
        }
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<String> {
        let mut request = self.http.post(&self.config.endpoint).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ExpenseOpsError::upstream(format!(
                "model endpoint '{}' returned {}",
                self.config.name, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExpenseOpsError::internal(format!(
                "model endpoint '{}' rejected request ({}): {}",
                self.config.name, status, body
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        debug!(provider = %self.config.name, chars = parsed.output.len(), "model response received");
        Ok(parsed.output)
    }
}

/// Vision model backed by a JSON-over-HTTP endpoint
pub struct HttpVisionModel {
    endpoint: ModelEndpoint,
}

impl HttpVisionModel {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            endpoint: ModelEndpoint::new(config),
        }
    }
}

#[async_trait]
impl VisionModel for HttpVisionModel {
    async fn generate(&self, request: VisionRequest<'_>) -> Result<String> {
        let body = json!({
            "model": self.endpoint.config.model,
            "prompt": request.prompt,
            "image": { "mime_type": request.mime, "data": request.image_base64 },
        });
        self.endpoint.post_generate(body).await
    }
}

/// Text model backed by a JSON-over-HTTP endpoint
pub struct HttpTextModel {
    endpoint: ModelEndpoint,
}

impl HttpTextModel {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            endpoint: ModelEndpoint::new(config),
        }
    }
}

#[async_trait]
impl TextModel for HttpTextModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.endpoint.config.model,
            "prompt": prompt,
        });
        self.endpoint.post_generate(body).await
    }
}
