// API request handlers

use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agents::{Pathway, ProcessOptions};
use crate::domain::{CategorizedReceipt, ExpenseOpsError};

use super::error::{ApiError, ApiResult};
use super::routes::AppState;

/// Health check handler
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "version": crate::VERSION }))
}

/// Process a receipt through the deterministic rule-engine pathway
pub async fn upload_receipt(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<CategorizedReceipt>> {
    process_upload(state, multipart, Pathway::Rules).await
}

/// Process a receipt through the LLM pathway
pub async fn upload_receipt_agents(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<CategorizedReceipt>> {
    process_upload(state, multipart, Pathway::Agents).await
}

async fn process_upload(
    state: AppState,
    mut multipart: Multipart,
    pathway: Pathway,
) -> ApiResult<Json<CategorizedReceipt>> {
    let mut file: Option<Vec<u8>> = None;
    let mut additional_context: Option<String> = None;
    let mut dry_run = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(ExpenseOpsError::invalid_input(format!("multipart: {}", e))))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError(ExpenseOpsError::invalid_input(format!("file field: {}", e)))
                })?;
                file = Some(bytes.to_vec());
            }
            "additional_context" => {
                additional_context = Some(field.text().await.map_err(|e| {
                    ApiError(ExpenseOpsError::invalid_input(format!("context field: {}", e)))
                })?);
            }
            "dry_run" => {
                let text = field.text().await.unwrap_or_default();
                dry_run = matches!(text.trim(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    let content = file.ok_or_else(|| {
        ApiError(ExpenseOpsError::invalid_input(
            "multipart form must include a 'file' field",
        ))
    })?;

    let result = state
        .orchestrator
        .process(
            content,
            ProcessOptions {
                pathway,
                dry_run,
                context: additional_context,
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(result))
}

/// Report token validity without touching the provider
pub async fn auth_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let status = state.oauth.status()?;
    Ok(Json(serde_json::to_value(status).map_err(ExpenseOpsError::from)?))
}

/// Produce a fresh authorization URL for the consent flow
pub async fn auth_url(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let state_token = Uuid::new_v4().to_string();
    let url = state.oauth.authorize_url(&state_token)?;
    Ok(Json(json!({ "auth_url": url, "state": state_token })))
}
