use std::time::Duration;

use thiserror::Error;

/// Result type alias for expense-ops operations
pub type Result<T> = std::result::Result<T, ExpenseOpsError>;

/// Error type covering every failure surfaced by the core
#[derive(Error, Debug)]
pub enum ExpenseOpsError {
    /// Input rejected before processing (unreadable, empty, malformed request)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Input outside the accepted size range
    #[error("Invalid size: {bytes} bytes (accepted range {min}..={max})")]
    InvalidSize { bytes: usize, min: usize, max: usize },

    /// Magic bytes did not match any supported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The artifact matched a known format but could not be decoded
    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    /// Vision model returned unusable output after the retry budget
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Text model returned unusable output after the retry budget
    #[error("Categorization failed: {0}")]
    CategorizationFailed(String),

    /// Provider daily request quota reached; not retryable within the day
    #[error("Daily quota exceeded for provider '{provider}'")]
    DailyQuotaExceeded { provider: String },

    /// Token refresh failed; the user must re-authorize
    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    /// Upstream service unavailable after the retry budget
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Stage deadline expired
    #[error("Stage '{stage}' timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    /// Cancellation token fired
    #[error("Canceled")]
    Canceled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule file validation errors
    #[error("Rule validation error: {0}")]
    RuleValidation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal invariant violations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExpenseOpsError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        ExpenseOpsError::InvalidInput(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        ExpenseOpsError::Config(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ExpenseOpsError::Internal(msg.into())
    }

    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        ExpenseOpsError::UpstreamUnavailable(msg.into())
    }

    /// Whether a single automatic in-stage retry is warranted
    pub fn is_transient(&self) -> bool {
        match self {
            ExpenseOpsError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ExpenseOpsError::UpstreamUnavailable(_) => true,
            _ => false,
        }
    }

    /// Process exit code for the CLI surface
    pub fn exit_code(&self) -> i32 {
        match self {
            ExpenseOpsError::InvalidInput(_)
            | ExpenseOpsError::InvalidSize { .. }
            | ExpenseOpsError::UnsupportedFormat(_)
            | ExpenseOpsError::CorruptedFile(_) => 2,
            ExpenseOpsError::AuthExpired(_) => 3,
            ExpenseOpsError::Canceled => 130,
            _ => 1,
        }
    }

    /// Short machine-readable kind used in audit payloads
    pub fn kind(&self) -> &'static str {
        match self {
            ExpenseOpsError::InvalidInput(_) => "invalid_input",
            ExpenseOpsError::InvalidSize { .. } => "invalid_size",
            ExpenseOpsError::UnsupportedFormat(_) => "unsupported_format",
            ExpenseOpsError::CorruptedFile(_) => "corrupted_file",
            ExpenseOpsError::ExtractionFailed(_) => "extraction_failed",
            ExpenseOpsError::CategorizationFailed(_) => "categorization_failed",
            ExpenseOpsError::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
            ExpenseOpsError::AuthExpired(_) => "auth_expired",
            ExpenseOpsError::UpstreamUnavailable(_) => "upstream_unavailable",
            ExpenseOpsError::Timeout { .. } => "timeout",
            ExpenseOpsError::Canceled => "canceled",
            ExpenseOpsError::Config(_) => "config",
            ExpenseOpsError::RuleValidation(_) => "rule_validation",
            ExpenseOpsError::Io(_) => "io",
            ExpenseOpsError::Serialization(_) => "serialization",
            ExpenseOpsError::Http(_) => "http",
            ExpenseOpsError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExpenseOpsError::invalid_input("x").exit_code(), 2);
        assert_eq!(
            ExpenseOpsError::UnsupportedFormat("zip".into()).exit_code(),
            2
        );
        assert_eq!(ExpenseOpsError::AuthExpired("expired".into()).exit_code(), 3);
        assert_eq!(ExpenseOpsError::Canceled.exit_code(), 130);
        assert_eq!(
            ExpenseOpsError::ExtractionFailed("bad json".into()).exit_code(),
            1
        );
        assert_eq!(
            ExpenseOpsError::DailyQuotaExceeded {
                provider: "vision".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExpenseOpsError::upstream("503").is_transient());
        assert!(!ExpenseOpsError::AuthExpired("x".into()).is_transient());
        assert!(!ExpenseOpsError::Canceled.is_transient());
    }
}
