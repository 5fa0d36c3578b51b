//! OAuth-aware QuickBooks Online client.
//!
//! Reads (vendor lookup, account lists) go through the TTL cache; writes
//! never do. A 401 triggers exactly one unconditional token refresh and
//! retry; a 429 honors the server's Retry-After (bounded); a 5xx is retried
//! once. Purchase creation is never implicitly retried beyond those cases,
//! so a flaky network cannot double-book an expense.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::OAuthManager;
use crate::cache::TtlCache;
use crate::domain::{CategorizedReceipt, Category, ExpenseOpsError, Result};
use crate::observability::CorrelationId;

const VENDOR_TTL: Duration = Duration::from_secs(10 * 60);
const ACCOUNT_TTL: Duration = Duration::from_secs(15 * 60);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);
const MINOR_VERSION: &str = "65";

/// QuickBooks vendor reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorRef {
    pub id: String,
    pub display_name: String,
}

/// QuickBooks account reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: String,
    pub name: String,
    pub account_type: String,
}

/// Created purchase record
#[derive(Debug, Clone)]
pub struct PurchaseRef {
    pub id: String,
    pub total: Decimal,
}

pub struct QuickBooksClient {
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
    base_url: String,
    vendor_cache: TtlCache<VendorRef>,
    account_cache: TtlCache<Vec<AccountRef>>,
}

impl QuickBooksClient {
    pub fn new(oauth: Arc<OAuthManager>, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            oauth,
            base_url: base_url.trim_end_matches('/').to_string(),
            vendor_cache: TtlCache::default(),
            account_cache: TtlCache::default(),
        }
    }

    /// Lightweight connectivity probe for the `status` command
    pub async fn probe(&self) -> Result<()> {
        let company_id = self.oauth.company_id()?;
        let path = format!("/v3/company/{}/companyinfo/{}", company_id, company_id);
        self.execute(Method::GET, &path, None).await?;
        Ok(())
    }

    /// Find a vendor by display name, creating it when absent. Cached.
    pub async fn find_or_create_vendor(&self, name: &str) -> Result<VendorRef> {
        let key = format!("vendor:{}", name.to_lowercase());
        self.vendor_cache
            .get_or_compute(&key, VENDOR_TTL, || self.lookup_or_create_vendor(name))
            .await
    }

    async fn lookup_or_create_vendor(&self, name: &str) -> Result<VendorRef> {
        let escaped = name.replace('\'', "\\'");
        let query = format!(
            "select Id, DisplayName from Vendor where DisplayName = '{}'",
            escaped
        );
        let response = self.run_query(&query).await?;
        if let Some(vendor) = response
            .pointer("/QueryResponse/Vendor/0")
            .and_then(parse_vendor)
        {
            debug!(vendor = %vendor.display_name, "vendor found");
            return Ok(vendor);
        }

        let company_id = self.oauth.company_id()?;
        let created = self
            .execute(
                Method::POST,
                &format!("/v3/company/{}/vendor", company_id),
                Some(json!({ "DisplayName": name })),
            )
            .await?;
        let vendor = created
            .pointer("/Vendor")
            .and_then(parse_vendor)
            .ok_or_else(|| ExpenseOpsError::internal("vendor create response missing Vendor"))?;
        info!(vendor = %vendor.display_name, id = %vendor.id, "vendor created");
        Ok(vendor)
    }

    /// Expense accounts, cached
    pub async fn expense_accounts(&self) -> Result<Vec<AccountRef>> {
        self.account_cache
            .get_or_compute("accounts:expense", ACCOUNT_TTL, || {
                self.fetch_accounts("select Id, Name, AccountType from Account where AccountType = 'Expense'")
            })
            .await
    }

    /// Bank and credit-card accounts usable as the payment side, cached
    pub async fn payment_accounts(&self) -> Result<Vec<AccountRef>> {
        self.account_cache
            .get_or_compute("accounts:payment", ACCOUNT_TTL, || {
                self.fetch_accounts(
                    "select Id, Name, AccountType from Account where AccountType in ('Bank', 'Credit Card')",
                )
            })
            .await
    }

    async fn fetch_accounts(&self, query: &str) -> Result<Vec<AccountRef>> {
        let response = self.run_query(query).await?;
        let accounts = response
            .pointer("/QueryResponse/Account")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_account).collect())
            .unwrap_or_default();
        Ok(accounts)
    }

    /// Create the Purchase record for a categorized receipt.
    ///
    /// The correlation ID lands in `PrivateNote`, so a caller recovering from
    /// an ambiguous failure can query for it instead of re-posting.
    pub async fn create_purchase(
        &self,
        receipt: &CategorizedReceipt,
        correlation_id: &CorrelationId,
    ) -> Result<PurchaseRef> {
        let vendor = self.find_or_create_vendor(&receipt.receipt.vendor_name).await?;
        let expense_accounts = self.expense_accounts().await?;
        let payment_accounts = self.payment_accounts().await?;

        let payment_account = payment_accounts.first().ok_or_else(|| {
            ExpenseOpsError::internal("no bank or credit card account available in QuickBooks")
        })?;

        let body = build_purchase_body(
            receipt,
            &vendor,
            &expense_accounts,
            payment_account,
            correlation_id,
        )?;

        let company_id = self.oauth.company_id()?;
        let response = self
            .execute(
                Method::POST,
                &format!("/v3/company/{}/purchase", company_id),
                Some(body),
            )
            .await?;

        let id = response
            .pointer("/Purchase/Id")
            .and_then(Value::as_str)
            .ok_or_else(|| ExpenseOpsError::internal("purchase response missing Id"))?
            .to_string();

        info!(purchase_id = %id, vendor = %vendor.display_name, "purchase created");
        Ok(PurchaseRef {
            id,
            total: receipt.total_original,
        })
    }

    async fn run_query(&self, query: &str) -> Result<Value> {
        let company_id = self.oauth.company_id()?;
        let path = format!(
            "/v3/company/{}/query?query={}",
            company_id,
            urlencode(query)
        );
        self.execute(Method::GET, &path, None).await
    }

    /// Execute one API call under the 401/429/5xx policy.
    async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut token = self.oauth.get_valid_access_token().await?;
        let mut refreshed = false;
        let mut retried_server = false;
        let mut retried_throttle = false;

        loop {
            let url = format!("{}{}{}", self.base_url, path, minor_version_suffix(path));
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json().await?);
            }

            match status {
                StatusCode::UNAUTHORIZED if !refreshed => {
                    warn!("accounting API returned 401, forcing token refresh");
                    token = self.oauth.force_refresh().await?;
                    refreshed = true;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(ExpenseOpsError::AuthExpired(
                        "accounting API rejected a freshly refreshed token".to_string(),
                    ));
                }
                StatusCode::TOO_MANY_REQUESTS if !retried_throttle => {
                    let delay = retry_after(&response).min(MAX_RETRY_AFTER);
                    warn!(?delay, "accounting API throttled, waiting");
                    tokio::time::sleep(delay).await;
                    retried_throttle = true;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    return Err(ExpenseOpsError::upstream(
                        "accounting API still throttling after retry".to_string(),
                    ));
                }
                status if status.is_server_error() && !retried_server => {
                    warn!(%status, "accounting API server error, retrying once");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    retried_server = true;
                }
                status if status.is_server_error() => {
                    return Err(ExpenseOpsError::upstream(format!(
                        "accounting API returned {} after retry",
                        status
                    )));
                }
                status => {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(ExpenseOpsError::internal(format!(
                        "accounting API rejected request ({}): {}",
                        status, detail
                    )));
                }
            }
        }
    }
}

fn minor_version_suffix(path: &str) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{}minorversion={}", sep, MINOR_VERSION)
}

fn retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5))
}

fn parse_vendor(value: &Value) -> Option<VendorRef> {
    Some(VendorRef {
        id: value.get("Id")?.as_str()?.to_string(),
        display_name: value.get("DisplayName")?.as_str()?.to_string(),
    })
}

fn parse_account(value: &Value) -> Option<AccountRef> {
    Some(AccountRef {
        id: value.get("Id")?.as_str()?.to_string(),
        name: value.get("Name")?.as_str()?.to_string(),
        account_type: value.get("AccountType")?.as_str()?.to_string(),
    })
}

/// Preferred account name fragment per category
fn account_name_hint(category: Category) -> &'static str {
    match category {
        Category::TravelLodging | Category::TravelTaxes => "travel",
        Category::TravelMeals | Category::MealsEntertainment => "meals",
        Category::OfficeSupplies => "office",
        Category::FuelVehicle => "vehicle",
        Category::CapitalEquipment => "equipment",
        Category::TaxGstHst => "tax",
        Category::ProfessionalServices => "professional",
        Category::UncategorizedReviewRequired => "uncategorized",
    }
}

fn pick_account<'a>(accounts: &'a [AccountRef], category: Category) -> Option<&'a AccountRef> {
    let hint = account_name_hint(category);
    accounts
        .iter()
        .find(|a| a.name.to_lowercase().contains(hint))
        .or_else(|| accounts.first())
}

pub(crate) fn build_purchase_body(
    receipt: &CategorizedReceipt,
    vendor: &VendorRef,
    expense_accounts: &[AccountRef],
    payment_account: &AccountRef,
    correlation_id: &CorrelationId,
) -> Result<Value> {
    let mut lines = Vec::with_capacity(receipt.items.len());
    for item in &receipt.items {
        let account = pick_account(expense_accounts, item.category).ok_or_else(|| {
            ExpenseOpsError::internal("no expense account available in QuickBooks")
        })?;
        lines.push(json!({
            "DetailType": "AccountBasedExpenseLineDetail",
            "Amount": item.original_amount,
            "Description": item.description,
            "AccountBasedExpenseLineDetail": {
                "AccountRef": { "value": account.id, "name": account.name }
            }
        }));
    }

    Ok(json!({
        "PaymentType": "Cash",
        "TxnDate": receipt.receipt.transaction_date.format("%Y-%m-%d").to_string(),
        "AccountRef": { "value": payment_account.id, "name": payment_account.name },
        "EntityRef": { "value": vendor.id, "name": vendor.display_name, "type": "Vendor" },
        "CurrencyRef": { "value": receipt.receipt.currency },
        "PrivateNote": format!("expense-ops correlation_id={}", correlation_id),
        "Line": lines,
    }))
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
