//! Axum extractors and header helpers for authentication.

use axum::extract::FromRequestParts;
use axum::http::header;
use chrono::Utc;
use http::request::Parts;

use crate::state::AppState;
use crate::store::{Account, TokenRecord};
use crate::web::error::ApiError;

/// Cookie carrying the bearer token for browser clients.
pub const SESSION_COOKIE: &str = "session_token";

/// Extractor resolving the bearer token (Authorization header or
/// `session_token` cookie) to an authenticated account.
///
/// Rejects with `401 unauthorized` when the token is missing, unknown,
/// revoked, or expired.
pub struct AuthAccount {
    pub account: Account,
    pub token: TokenRecord,
}

impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("no bearer token presented"))?;

        let (account, record) = state
            .store
            .get_account_by_token(&token, Utc::now())
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::unauthorized("token is invalid or expired"))?;

        // Fire-and-forget last-seen update; resolution must not wait on it.
        let store = state.store.clone();
        let account_id = account.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_account(account_id, Utc::now()).await {
                tracing::warn!(error = %e, "failed to touch account");
            }
        });

        Ok(AuthAccount {
            account,
            token: record,
        })
    }
}

/// Pull the token plaintext out of `Authorization: Bearer …` or the
/// session cookie, in that order.
pub fn extract_token(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_owned());
        }
    }

    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix("session_token=")
                .map(|v| v.to_owned())
        })
}

/// Best-effort client IP: first hop of X-Forwarded-For.
pub fn client_ip(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

pub fn user_agent(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
}

/// Build a `Set-Cookie` value for the session token.
pub fn session_cookie(token: &str, max_age: i64, secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        headers.insert(
            header::COOKIE,
            "session_token=cookie-token".parse().unwrap(),
        );
        assert_eq!(extract_token(&headers), Some("abc123".to_owned()));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; session_token=tok; lang=en".parse().unwrap(),
        );
        assert_eq!(extract_token(&headers), Some("tok".to_owned()));
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(extract_token(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), Some("1.2.3.4".to_owned()));
    }

    #[test]
    fn session_cookie_shape() {
        let cookie = session_cookie("tok", 3600, true);
        assert!(cookie.starts_with("session_token=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.ends_with("; Secure"));
    }
}
