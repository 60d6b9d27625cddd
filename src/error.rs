use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::security::rate_limit::RateLimitDecision;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Rejections surfaced to HTTP clients.
///
/// Messages are deliberately generic; the detail that caused a rejection is
/// logged through the audit logger, never returned.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid CSRF token")]
    Csrf,

    #[error("Too many requests")]
    RateLimited(RateLimitDecision),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} temporarily unavailable")]
    ServiceUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Csrf => StatusCode::FORBIDDEN,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        match &self {
            ApiError::RateLimited(decision) => {
                decision.write_headers(&mut headers);
                headers.insert(
                    "retry-after",
                    HeaderValue::from(decision.retry_after_secs()),
                );
            }
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
            }
            _ => {}
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, headers, body).into_response()
    }
}
