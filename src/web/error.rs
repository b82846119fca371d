//! HTTP mapping of the domain error taxonomy.
//!
//! Every error leaves the API as `{"error": {"code", "message"}}` with a
//! machine-readable code. Internal and crypto failures are logged
//! server-side and surface as a generic message.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::borrow::Cow;

use crate::error::AppError;

/// A fully mapped API error: status, wire code, message, and an optional
/// `Retry-After` value for rate limiting.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: Cow<'static, str>,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Cow::Borrowed(code),
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn invalid_state() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            "OAuth state is unknown, expired, or already used",
        )
    }

    pub fn invalid_code() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_code",
            "the authorization code was rejected",
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "an internal error occurred",
        )
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(message) => Self::validation(message),
            AppError::Unauthorized(message) => Self::unauthorized(message),
            AppError::NotFound(message) => Self::not_found(message),
            AppError::Conflict { code, message } => Self {
                status: StatusCode::CONFLICT,
                code: Cow::Borrowed(code),
                message,
                retry_after_secs: None,
            },
            AppError::RateLimited { retry_after_secs } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: Cow::Borrowed("rate_limited"),
                message: "too many requests".into(),
                retry_after_secs: Some(retry_after_secs),
            },
            AppError::RemoteUnavailable { service, message } => {
                tracing::warn!(service, %message, "upstream unavailable");
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    code: Cow::Owned(format!("{service}_unavailable")),
                    message: format!("{service} is unavailable"),
                    retry_after_secs: None,
                }
            }
            AppError::SshConnect(message) => Self::new(
                StatusCode::BAD_GATEWAY,
                "ssh_connect_failed",
                message,
            ),
            AppError::SshLaunch(message) => Self::new(
                StatusCode::BAD_GATEWAY,
                "ssh_launch_failed",
                message,
            ),
            AppError::Crypto(message) => {
                tracing::error!(%message, "crypto failure");
                Self::internal()
            }
            AppError::Internal(e) => {
                tracing::error!(error = ?e, "internal error");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message }
        }));
        match self.retry_after_secs {
            Some(secs) => (
                self.status,
                [(header::RETRY_AFTER, secs.to_string())],
                body,
            )
                .into_response(),
            None => (self.status, body).into_response(),
        }
    }
}

/// Handlers return this; `?` converts both AppError and ApiError.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_codes_pass_through() {
        let api: ApiError = AppError::conflict("last_key", "cannot remove").into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "last_key");
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let api: ApiError = AppError::RateLimited {
            retry_after_secs: 42,
        }
        .into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.retry_after_secs, Some(42));
    }

    #[test]
    fn crypto_failures_do_not_leak_detail() {
        let api: ApiError = AppError::Crypto("tag mismatch in envelope".into()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("tag"));
    }

    #[test]
    fn remote_unavailable_builds_service_code() {
        let api: ApiError = AppError::RemoteUnavailable {
            service: "github",
            message: "connect timeout".into(),
        }
        .into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.code, "github_unavailable");
    }
}
