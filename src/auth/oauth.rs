//! OAuth2 manager with rotating-refresh semantics.
//!
//! At most one refresh request is in flight per process: callers that find a
//! stale bundle serialize on a mutex, re-read the store inside the critical
//! section (another caller may have refreshed already) and only then hit the
//! provider. The provider may return the same refresh token or a new one;
//! either way the persisted bundle is replaced atomically.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::QuickBooksConfig;
use crate::domain::{ExpenseOpsError, Result};
use crate::observability::{AuditKind, AuditLogger, CorrelationId};

use super::token_store::{TokenBundle, TokenStore};

/// Proactive refresh margin before the stated expiry
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

pub const OAUTH_SCOPE: &str = "com.intuit.quickbooks.accounting";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    x_refresh_token_expires_in: Option<i64>,
}

/// Report produced for the `status` command and `/auth-status` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authorized: bool,
    pub access_token_valid: bool,
    pub refresh_token_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<chrono::DateTime<Utc>>,
}

pub struct OAuthManager {
    store: TokenStore,
    http: reqwest::Client,
    config: QuickBooksConfig,
    refresh_lock: Mutex<()>,
    refresh_skew: Duration,
    audit: AuditLogger,
}

impl OAuthManager {
    pub fn new(store: TokenStore, config: QuickBooksConfig, audit: AuditLogger) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            config,
            refresh_lock: Mutex::new(()),
            refresh_skew: Duration::seconds(DEFAULT_REFRESH_SKEW_SECS),
            audit,
        }
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    /// QuickBooks company the tokens are bound to
    pub fn company_id(&self) -> Result<String> {
        let bundle = self.require_bundle()?;
        Ok(bundle.company_id)
    }

    /// Return an access token guaranteed fresh for at least the skew window.
    pub async fn get_valid_access_token(&self) -> Result<String> {
        let bundle = self.require_bundle()?;
        if !bundle.is_stale(self.refresh_skew, Utc::now()) {
            return Ok(bundle.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Re-read: another caller may have refreshed while we waited
        let bundle = self.require_bundle()?;
        if !bundle.is_stale(self.refresh_skew, Utc::now()) {
            debug!("token already refreshed by a concurrent caller");
            return Ok(bundle.access_token);
        }
        self.refresh(&bundle).await
    }

    /// Refresh unconditionally, bypassing the staleness check. Used when the
    /// accounting API answers 401 despite a seemingly fresh token.
    pub async fn force_refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        let bundle = self.require_bundle()?;
        self.refresh(&bundle).await
    }

    async fn refresh(&self, bundle: &TokenBundle) -> Result<String> {
        if bundle.refresh_token_expired(Utc::now()) {
            return Err(ExpenseOpsError::AuthExpired(
                "refresh token expired; re-run `expense-ops auth`".to_string(),
            ));
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, self.client_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", bundle.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ExpenseOpsError::AuthExpired(format!("refresh request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "token refresh rejected");
            return Err(ExpenseOpsError::AuthExpired(format!(
                "provider rejected refresh ({}): {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExpenseOpsError::AuthExpired(format!("refresh response: {}", e)))?;

        let now = Utc::now();
        let rotated = parsed
            .refresh_token
            .as_ref()
            .map(|rt| rt != &bundle.refresh_token)
            .unwrap_or(false);
        let new_bundle = TokenBundle {
            access_token: parsed.access_token.clone(),
            // The provider may rotate the refresh token; absent means keep
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| bundle.refresh_token.clone()),
            access_token_issued_at: now,
            access_token_lifetime_secs: parsed.expires_in,
            refresh_token_issued_at: if rotated {
                now
            } else {
                bundle.refresh_token_issued_at
            },
            refresh_token_lifetime_secs: parsed
                .x_refresh_token_expires_in
                .unwrap_or(bundle.refresh_token_lifetime_secs),
            company_id: bundle.company_id.clone(),
        };
        self.store.save(&new_bundle)?;

        info!(rotated, "access token refreshed");
        self.audit.emit(
            &CorrelationId::new(),
            AuditKind::TokenRefresh,
            json!({ "rotated_refresh_token": rotated }),
        );

        Ok(parsed.access_token)
    }

    /// Authorization URL for the browser-based consent flow
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_base_url)
            .map_err(|e| ExpenseOpsError::config(format!("auth_base_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", OAUTH_SCOPE)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Exchange an authorization code for the initial token bundle
    pub async fn exchange_code(&self, code: &str, company_id: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, self.client_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExpenseOpsError::AuthExpired(format!(
                "code exchange rejected ({}): {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response.json().await?;
        let now = Utc::now();
        let bundle = TokenBundle {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            access_token_issued_at: now,
            access_token_lifetime_secs: parsed.expires_in,
            refresh_token_issued_at: now,
            refresh_token_lifetime_secs: parsed.x_refresh_token_expires_in.unwrap_or(8_726_400),
            company_id: company_id.to_string(),
        };
        self.store.save(&bundle)?;
        info!(company_id, "authorization complete");
        Ok(())
    }

    /// Token validity snapshot, without touching the network
    pub fn status(&self) -> Result<AuthStatus> {
        let now = Utc::now();
        match self.store.load()? {
            None => Ok(AuthStatus {
                authorized: false,
                access_token_valid: false,
                refresh_token_valid: false,
                company_id: None,
                access_expires_at: None,
            }),
            Some(bundle) => Ok(AuthStatus {
                authorized: true,
                access_token_valid: !bundle.is_stale(self.refresh_skew, now),
                refresh_token_valid: !bundle.refresh_token_expired(now),
                company_id: Some(bundle.company_id.clone()),
                access_expires_at: Some(bundle.access_expires_at()),
            }),
        }
    }

    /// Drop persisted tokens (used by `auth --force`)
    pub fn reset(&self) -> Result<()> {
        self.store.delete()
    }

    fn require_bundle(&self) -> Result<TokenBundle> {
        self.store.load()?.ok_or_else(|| {
            ExpenseOpsError::AuthExpired(
                "no stored tokens; run `expense-ops auth` first".to_string(),
            )
        })
    }

    fn client_secret(&self) -> Option<&str> {
        self.config.client_secret.as_deref()
    }
}
