use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::domain::ExpenseOpsError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP-facing wrapper around the core error type
#[derive(Debug)]
pub struct ApiError(pub ExpenseOpsError);

impl From<ExpenseOpsError> for ApiError {
    fn from(e: ExpenseOpsError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ExpenseOpsError::InvalidInput(_)
            | ExpenseOpsError::InvalidSize { .. }
            | ExpenseOpsError::UnsupportedFormat(_)
            | ExpenseOpsError::CorruptedFile(_) => StatusCode::BAD_REQUEST,
            ExpenseOpsError::AuthExpired(_) => StatusCode::UNAUTHORIZED,
            ExpenseOpsError::DailyQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ExpenseOpsError::Canceled => StatusCode::REQUEST_TIMEOUT,
            ExpenseOpsError::Timeout { .. } | ExpenseOpsError::UpstreamUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
