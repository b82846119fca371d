//! Domain error taxonomy shared across the store, session manager and web
//! layer. The web layer maps these onto the HTTP envelope in
//! `web::error`.

use thiserror::Error;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// Typed failure kinds. Handlers catch these at the outer layer; everything
/// unexpected travels as `Internal` and surfaces as a generic 500.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// Precondition failures with a machine-readable code: `last_key`,
    /// `keypair_revoked`, `session_limit_reached`, `insufficient_credits`,
    /// `host_key_changed`.
    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// GitHub or Stripe unreachable. `service` feeds the error code
    /// (`github_unavailable` / `stripe_unavailable`).
    #[error("{service} unavailable: {message}")]
    RemoteUnavailable {
        service: &'static str,
        message: String,
    },

    #[error("ssh connection failed: {0}")]
    SshConnect(String),

    #[error("ssh launch failed: {0}")]
    SshLaunch(String),

    /// KEK derivation or envelope decryption mismatch. The message stays
    /// server-side; clients only ever see a generic 500.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }
}
