//! Typed gateway errors and their HTTP mapping.
//!
//! Every failure the request path can produce is an explicit
//! [`GatewayError`] kind with a fixed status code — validation failures and
//! backend failures are different branches, not interchangeable strings.
//! Handlers return `Result<T, GatewayError>` and propagate with `?`; the
//! [`IntoResponse`] impl renders the uniform failure envelope
//! (`success: false`, `error_message`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Everything that can go wrong while serving a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or out-of-bounds request. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The named session does not exist or has expired.
    #[error("session `{0}` not found")]
    SessionNotFound(String),

    /// Neither the primary nor the fallback backend for the use case is
    /// dispatchable.
    #[error("no healthy backend for use case `{0}`")]
    NoHealthyBackend(String),

    /// The backend answered with a failure status. 4xx responses land here
    /// untouched; 5xx responses land here once the retry budget is spent.
    #[error("backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    /// The request deadline elapsed before a response arrived.
    #[error("request deadline exceeded")]
    Timeout,

    /// The backend's concurrency cap is exhausted; the caller should back off.
    #[error("backend is overloaded")]
    Overloaded,

    /// Anything unexpected. Logged; the session binding is preserved.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoHealthyBackend(_) | Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "request failed");
        (
            self.status_code(),
            Json(json!({
                "success": false,
                "error_message": self.to_string(),
            })),
        )
            .into_response()
    }
}

/// Unexpected infrastructure failures collapse into `Internal`.
impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_error_contract() {
        assert_eq!(
            GatewayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::SessionNotFound("s".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoHealthyBackend("stt".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Backend { status: 404, message: "nope".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn no_healthy_backend_message_names_the_condition() {
        let message = GatewayError::NoHealthyBackend("stt".into()).to_string();
        assert!(message.contains("no healthy backend"));
        assert!(message.contains("stt"));
    }
}
