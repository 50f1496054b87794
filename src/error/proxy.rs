use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

use super::IsRetryable;
use super::oauth::OauthError;

const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;

#[derive(Debug, ThisError)]
pub enum ProxyError {
    /// Missing or invalid API key.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(&'static str),

    /// Authenticated but not allowed (deactivated user, non-admin, locked donation).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Daily quota or per-minute rate breached.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The pool has nothing selectable under the current policy.
    #[error("No available credential: {0}")]
    NoCredentialAvailable(String),

    /// Malformed client input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream Code Assist answered with a non-success status. Whether the
    /// dispatcher retries or disables the credential is decided by
    /// [`ProxyError::is_retryable`] / [`ProxyError::is_auth_failure`].
    #[error("Upstream error: status={status} body={body:.200}")]
    Upstream { status: StatusCode, body: String },

    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ractor error: {0}")]
    Ractor(String),

    #[error("Vault error: {0}")]
    Crypto(String),

    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Upstream status that should disable the credential (revoked token,
    /// banned project). OAuth `invalid_grant` maps here too.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ProxyError::Upstream { status, .. } => matches!(
                *status,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ),
            ProxyError::Oauth(OauthError::ServerResponse { .. }) => true,
            _ => false,
        }
    }

    /// Short error text persisted into `credentials.last_error`. Keeps the
    /// numeric status in front so the failure classifier can match it.
    pub fn failure_text(&self) -> String {
        match self {
            ProxyError::Upstream { status, body } => {
                format!("{} {:.len$}", status.as_u16(), body, len = UPSTREAM_BODY_PREVIEW_CHARS)
            }
            other => format!("{other:.300}"),
        }
    }

    /// HTTP status recorded in the usage log for a failed upstream attempt.
    pub fn upstream_status_code(&self) -> u16 {
        match self {
            ProxyError::Upstream { status, .. } => status.as_u16(),
            _ => 500,
        }
    }
}

impl IsRetryable for ProxyError {
    fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Upstream { status, body } => {
                matches!(
                    *status,
                    StatusCode::NOT_FOUND
                        | StatusCode::TOO_MANY_REQUESTS
                        | StatusCode::INTERNAL_SERVER_ERROR
                        | StatusCode::SERVICE_UNAVAILABLE
                ) || body.contains("RESOURCE_EXHAUSTED")
                    || body.contains("NOT_FOUND")
                    // Revoked credentials are disabled and the next one tried.
                    || matches!(*status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            }
            ProxyError::Oauth(e) => e.is_retryable(),
            ProxyError::Reqwest(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            ProxyError::Unauthenticated(reason) => (
                StatusCode::UNAUTHORIZED,
                ApiErrorObject {
                    code: "UNAUTHENTICATED".to_string(),
                    message: reason.to_string(),
                    details: None,
                },
            ),

            ProxyError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                ApiErrorObject {
                    code: "FORBIDDEN".to_string(),
                    message,
                    details: None,
                },
            ),

            ProxyError::QuotaExceeded(message) => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiErrorObject {
                    code: "RESOURCE_EXHAUSTED".to_string(),
                    message,
                    details: None,
                },
            ),

            ProxyError::NoCredentialAvailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorObject {
                    code: "NO_CREDENTIAL".to_string(),
                    message,
                    details: None,
                },
            ),

            ProxyError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                ApiErrorObject {
                    code: "INVALID_ARGUMENT".to_string(),
                    message,
                    details: None,
                },
            ),

            ProxyError::Upstream { status, body } => {
                tracing::warn!(
                    status = %status,
                    body = %format!("{:.len$}", body, len = UPSTREAM_BODY_PREVIEW_CHARS),
                    "surfacing upstream error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorObject {
                        code: "UPSTREAM_ERROR".to_string(),
                        message: format!(
                            "Upstream returned {status}: {:.len$}",
                            body,
                            len = UPSTREAM_BODY_PREVIEW_CHARS
                        ),
                        details: None,
                    },
                )
            }

            ProxyError::Oauth(_)
            | ProxyError::Reqwest(_)
            | ProxyError::StreamProtocol(_) => (
                StatusCode::BAD_GATEWAY,
                ApiErrorObject {
                    code: "UPSTREAM_ERROR".to_string(),
                    message: "Upstream service error.".to_string(),
                    details: None,
                },
            ),

            ProxyError::Json(_) => (
                StatusCode::BAD_GATEWAY,
                ApiErrorObject {
                    code: "BAD_UPSTREAM_PAYLOAD".to_string(),
                    message: "Failed to parse upstream response.".to_string(),
                    details: None,
                },
            ),

            ProxyError::Database(_)
            | ProxyError::Ractor(_)
            | ProxyError::Crypto(_)
            | ProxyError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorObject {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                    details: None,
                },
            ),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, code = %error_body.code, message = %error_body.message, "request failed");
        }

        (status, Json(ApiErrorBody { inner: error_body })).into_response()
    }
}

/// Standardized API error response payload.
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}
