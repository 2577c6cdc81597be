//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provider::{ErrorClassification, TranslationError};
use thiserror::Error;

/// Errors returned to callers of the relay's HTTP surface.
///
/// An identity rotation is not an error; it is forwarded to the run loop as a
/// `RotationSignal` and the request that triggered it still succeeds.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Total usage across the account pool would pass the safe limit.
    #[error("monthly translation limit reached")]
    LimitReached,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pool(#[from] quota_pool::Error),

    #[error(transparent)]
    Translation(#[from] TranslationError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Pool(quota_pool::Error::NotInitialized(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Translation(e) => match e.classification() {
                ErrorClassification::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
                ErrorClassification::Transient | ErrorClassification::Permanent => {
                    StatusCode::BAD_GATEWAY
                }
            },
        }
    }

    /// Stable `error.type` value in response bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::LimitReached => "limit_reached",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Pool(quota_pool::Error::NotInitialized(_)) => "not_initialized",
            RelayError::Pool(_) => "internal_error",
            RelayError::Translation(_) => "translation_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
