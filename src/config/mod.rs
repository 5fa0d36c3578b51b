use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{ExpenseOpsError, Result};

/// Environment variable names for secrets. Values are never written to disk
/// or to the audit log; a template file documents them for operators.
pub const ENV_QBO_CLIENT_SECRET: &str = "EXPENSE_OPS_QBO_CLIENT_SECRET";
pub const ENV_VISION_API_KEY: &str = "EXPENSE_OPS_VISION_API_KEY";
pub const ENV_TEXT_API_KEY: &str = "EXPENSE_OPS_TEXT_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding tokens.json, rate limiter state and the audit log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Principal's home province; rules may filter on it
    #[serde(default = "default_province")]
    pub province: String,

    /// Monetary rounding mode; only "half-up" is accepted
    #[serde(default = "default_rounding")]
    pub rounding: String,

    /// Rule file for the deterministic pathway; embedded defaults when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,

    /// Route a failed LLM pathway through the rule engine
    #[serde(default)]
    pub fallback_to_rules: bool,

    pub vision: ProviderConfig,

    pub text: ProviderConfig,

    pub quickbooks: QuickBooksConfig,

    /// Tax-guide retrieval service; retrieval is skipped when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Extra payload keys redacted by the audit logger
    #[serde(default)]
    pub sensitive_keys: Vec<String>,
}

/// One upstream model provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identifier; keys the rate limiter state file
    pub name: String,

    pub endpoint: String,

    pub model: String,

    /// Filled from the environment at load, never from the file
    #[serde(skip)]
    pub api_key: Option<String>,

    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    #[serde(default = "default_rpd")]
    pub requests_per_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickBooksConfig {
    pub client_id: String,

    /// Filled from the environment at load
    #[serde(skip)]
    pub client_secret: Option<String>,

    pub redirect_uri: String,

    #[serde(default = "default_qbo_base_url")]
    pub base_url: String,

    #[serde(default = "default_qbo_auth_url")]
    pub auth_base_url: String,

    #[serde(default = "default_qbo_token_url")]
    pub token_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".expense-ops")
}

fn default_province() -> String {
    "BC".to_string()
}

fn default_rounding() -> String {
    "half-up".to_string()
}

fn default_stage_timeout_secs() -> u64 {
    30
}

fn default_rpm() -> u32 {
    10
}

fn default_rpd() -> u32 {
    1500
}

fn default_qbo_base_url() -> String {
    "https://sandbox-quickbooks.api.intuit.com".to_string()
}

fn default_qbo_auth_url() -> String {
    "https://appcenter.intuit.com/connect/oauth2".to_string()
}

fn default_qbo_token_url() -> String {
    "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer".to_string()
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from a TOML file, then overlay secrets from the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ExpenseOpsError::config(format!("{}: {}", path.display(), e)))?;
        config.load_secrets();
        config.validate()?;
        Ok(config)
    }

    /// Secrets come from the environment only
    pub fn load_secrets(&mut self) {
        self.vision.api_key = std::env::var(ENV_VISION_API_KEY).ok();
        self.text.api_key = std::env::var(ENV_TEXT_API_KEY).ok();
        self.quickbooks.client_secret = std::env::var(ENV_QBO_CLIENT_SECRET).ok();
    }

    pub fn validate(&self) -> Result<()> {
        if self.rounding != "half-up" {
            return Err(ExpenseOpsError::config(format!(
                "unsupported rounding mode '{}' (only \"half-up\" is implemented)",
                self.rounding
            )));
        }
        if self.province.len() != 2 {
            return Err(ExpenseOpsError::config(format!(
                "province '{}' is not a 2-letter code",
                self.province
            )));
        }
        for provider in [&self.vision, &self.text] {
            if provider.name.is_empty() {
                return Err(ExpenseOpsError::config("provider name must be non-empty"));
            }
            if provider.requests_per_minute == 0 || provider.requests_per_day == 0 {
                return Err(ExpenseOpsError::config(format!(
                    "provider '{}' rate caps must be positive",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }
}
