//! Engine-level error type and the wire error taxonomy.
//!
//! Store adapters report [`crate::stores::StoreError`]; everything above the
//! adapter layer speaks [`EngramError`]. Request handlers translate the error
//! into one of the fixed wire codes.

use serde::{Deserialize, Serialize};

/// Wire-level error codes surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request fails schema or domain constraints
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// Embedding provider unavailable or returned malformed output
    #[serde(rename = "EMBEDDING_ERROR")]
    Embedding,
    /// Required (vector) store failed
    #[serde(rename = "STORAGE_ERROR")]
    Storage,
    /// Optional downstream store unavailable
    #[serde(rename = "DEPENDENCY_UNAVAILABLE")]
    DependencyUnavailable,
    /// Operation lacks user consent / authorization
    #[serde(rename = "CONSENT_DENIED")]
    ConsentDenied,
    /// Deadline exceeded
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Uncategorized
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::Embedding => "EMBEDDING_ERROR",
            ErrorCode::Storage => "STORAGE_ERROR",
            ErrorCode::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ErrorCode::ConsentDenied => "CONSENT_DENIED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    /// Request fails schema or domain constraints
    #[error("validation failed: {0}")]
    Validation(String),
    /// Embedding provider unavailable or returned malformed output
    #[error("embedding provider error: {0}")]
    Embedding(String),
    /// Required (vector) store failure
    #[error("storage error: {0}")]
    Storage(String),
    /// Optional downstream dependency unavailable
    #[error("dependency unavailable: {0}")]
    Dependency(String),
    /// Missing consent / authorization for the requested operation
    #[error("consent denied: {0}")]
    Consent(String),
    /// Deadline exceeded
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    /// Shared worker pool saturated (429-equivalent)
    #[error("worker pool saturated")]
    Saturated,
    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Uncategorized failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngramError {
    /// Map onto the wire taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            EngramError::Validation(_) => ErrorCode::Validation,
            EngramError::Embedding(_) => ErrorCode::Embedding,
            EngramError::Storage(_) => ErrorCode::Storage,
            EngramError::Dependency(_) | EngramError::Saturated => {
                ErrorCode::DependencyUnavailable
            }
            EngramError::Consent(_) => ErrorCode::ConsentDenied,
            EngramError::Timeout(_) => ErrorCode::Timeout,
            // The taxonomy has no NOT_FOUND; the HTTP layer maps this variant
            // to a 404 with a validation code.
            EngramError::NotFound(_) => ErrorCode::Validation,
            EngramError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Shorthand constructor for validation failures
    pub fn validation(msg: impl Into<String>) -> Self {
        EngramError::Validation(msg.into())
    }

    /// Shorthand constructor for internal failures
    pub fn internal(msg: impl Into<String>) -> Self {
        EngramError::Internal(msg.into())
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        EngramError::Internal(format!("serialization: {e}"))
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngramError>;
