//! HTTP error envelope.
//!
//! Every error response carries `{error_code, message, details?,
//! correlation_id}`; the engine taxonomy maps onto HTTP status codes here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use uuid::Uuid;

use engram_core::{EngramError, ErrorCode};

/// API-facing error
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::Validation, message)
    }
}

impl From<EngramError> for ApiError {
    fn from(e: EngramError) -> Self {
        let status = match &e {
            EngramError::Validation(_) => StatusCode::BAD_REQUEST,
            EngramError::Consent(_) => StatusCode::FORBIDDEN,
            EngramError::NotFound(_) => StatusCode::NOT_FOUND,
            EngramError::Saturated => StatusCode::TOO_MANY_REQUESTS,
            EngramError::Embedding(_) => StatusCode::BAD_GATEWAY,
            EngramError::Storage(_) | EngramError::Dependency(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngramError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        if self.status.is_server_error() {
            tracing::error!(
                correlation_id = %correlation_id,
                code = self.code.as_str(),
                "{}",
                self.message
            );
        } else {
            tracing::debug!(
                correlation_id = %correlation_id,
                code = self.code.as_str(),
                "{}",
                self.message
            );
        }
        let mut body = json!({
            "error_code": self.code.as_str(),
            "message": self.message,
            "correlation_id": correlation_id,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

/// Route handler result type
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e = ApiError::from(EngramError::Validation("bad".into()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code.as_str(), "VALIDATION_ERROR");

        let e = ApiError::from(EngramError::Consent("denied".into()));
        assert_eq!(e.status, StatusCode::FORBIDDEN);

        let e = ApiError::from(EngramError::Saturated);
        assert_eq!(e.status, StatusCode::TOO_MANY_REQUESTS);

        let e = ApiError::from(EngramError::Storage("down".into()));
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.code.as_str(), "STORAGE_ERROR");
    }
}
