//! Service error taxonomy and HTTP translation.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Failure kinds the service distinguishes.
///
/// User-path handlers surface the narrowest kind as an HTTP status; the
/// ingest path logs transient/permanent provider failures per (asset, metric)
/// and never lets one asset abort another.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request shape or range violations; 400 with a per-field message.
    #[error("{0}")]
    Validation(String),

    /// Unknown asset for the requested metric; 404.
    #[error("{0}")]
    NotFound(String),

    /// Missing or wrong API key on a protected endpoint; 401.
    #[error("{0}")]
    Unauthorized(String),

    /// 5xx / 429 / network failures that exhausted retries.
    #[error("provider temporarily unavailable: {0}")]
    ProviderTransient(String),

    /// Non-429 4xx or response schema mismatch; never retried.
    #[error("provider rejected request: {0}")]
    ProviderPermanent(String),

    /// Database unavailable or query failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::ProviderTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::ProviderPermanent(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unauthorized(_) => "unauthorized",
            ServiceError::ProviderTransient(_) => "provider_unavailable",
            ServiceError::ProviderPermanent(_) => "provider_error",
            ServiceError::Storage(_) => "storage_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        // Status-bearing errors split transient vs permanent; connect/timeout
        // failures are always transient.
        match e.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                ServiceError::ProviderTransient(e.to_string())
            }
            Some(_) => ServiceError::ProviderPermanent(e.to_string()),
            None => ServiceError::ProviderTransient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            ServiceError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::NotFound("missing".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Unauthorized("no key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::ProviderTransient("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::ProviderPermanent("schema".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::Storage("db".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
