use serde::{Deserialize, Serialize};

/// Field-level detail attached to a rejected payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Failures reported by a `RemoteApi` implementation.
///
/// Variants are split by cause so the caller can decide how to surface them:
/// validation detail goes back to a human, authentication failures force a
/// re-login, rate limits and 5xx are worth retrying later.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote record not found: {0}")]
    NotFound(String),

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        errors: Vec<FieldError>,
    },

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("service unavailable (status {status})")]
    ServiceUnavailable { status: u16 },

    #[error("request failed: {0}")]
    Request(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::ServiceUnavailable { .. }
                | RemoteError::Request(_)
        )
    }

    /// Field errors for `Validation`, empty otherwise.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            RemoteError::Validation { errors, .. } => errors,
            _ => &[],
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
