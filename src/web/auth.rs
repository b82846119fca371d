//! GitHub OAuth2 authentication handlers and session-token endpoints.
//!
//! The state parameter is single-use and stored hashed; the callback
//! consumes it atomically. The provider access token is sealed under the
//! owning account's KEK before it is persisted.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::error::AppError;
use crate::state::AppState;
use crate::store::{NewOAuthIdentity, NewToken};
use crate::web::error::{ApiError, ApiResult};
use crate::web::extractors::{AuthAccount, client_ip, session_cookie, user_agent};

/// Lifetime of an outstanding OAuth state row.
const STATE_TTL_MINUTES: i64 = 10;

const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";

fn callback_url(state: &AppState) -> String {
    format!(
        "{}/api/v1/auth/oauth/github/callback",
        state.config.web_domain.trim_end_matches('/')
    )
}

/// `POST /api/v1/auth/oauth/github/start` — rate-limited per IP.
pub async fn oauth_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ip = client_ip(&headers).unwrap_or_else(|| "unknown".to_owned());
    if let Err(retry_after_secs) = state.oauth_limiter.check(&ip) {
        return Err(AppError::RateLimited { retry_after_secs }.into());
    }

    let state_bytes: [u8; 32] = rand::rng().random();
    let oauth_state: String = state_bytes.iter().map(|b| format!("{b:02x}")).collect();
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier: String = verifier_bytes.iter().map(|b| format!("{b:02x}")).collect();

    state
        .store
        .put_oauth_state(
            &crypto::hash_token(&oauth_state),
            &verifier,
            Utc::now() + ChronoDuration::minutes(STATE_TTL_MINUTES),
        )
        .await?;

    let authorize_url = format!(
        "{GITHUB_AUTHORIZE_URL}?client_id={}&redirect_uri={}&scope=read:user%20user:email&state={}",
        state.config.github_client_id,
        urlencoding::encode(&callback_url(&state)),
        oauth_state,
    );

    Ok(Json(json!({
        "authorize_url": authorize_url,
        "state": oauth_state,
    })))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: String,
    state: String,
}

#[derive(Deserialize)]
struct GithubTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    email: Option<String>,
}

/// `GET /api/v1/auth/oauth/github/callback` — consume state, exchange the
/// code, link the identity, issue a session token. Browser clients get a
/// redirect plus cookie; `Accept: application/json` callers get the token
/// in the body.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let now = Utc::now();
    let consumed = state
        .store
        .consume_oauth_state(&crypto::hash_token(&params.state), now)
        .await?;
    if consumed.is_none() {
        warn!("oauth callback with unknown or expired state");
        return Err(ApiError::invalid_state());
    }

    // Exchange the authorization code.
    let client = reqwest::Client::new();
    let token_response = client
        .post(GITHUB_TOKEN_URL)
        .header(header::ACCEPT, "application/json")
        .form(&[
            ("client_id", state.config.github_client_id.as_str()),
            ("client_secret", state.config.github_client_secret.as_str()),
            ("code", params.code.as_str()),
            ("redirect_uri", callback_url(&state).as_str()),
        ])
        .timeout(state.config.request_timeout)
        .send()
        .await
        .map_err(|e| {
            ApiError::from(AppError::RemoteUnavailable {
                service: "github",
                message: e.to_string(),
            })
        })?;

    if !token_response.status().is_success() {
        return Err(ApiError::from(AppError::RemoteUnavailable {
            service: "github",
            message: format!("token exchange returned {}", token_response.status()),
        }));
    }

    let token_data: GithubTokenResponse = token_response.json().await.map_err(|e| {
        ApiError::from(AppError::RemoteUnavailable {
            service: "github",
            message: format!("unparseable token response: {e}"),
        })
    })?;

    let access_token = match (token_data.access_token, token_data.error) {
        (Some(token), _) => token,
        (None, Some(error)) => {
            warn!(error, "github rejected the authorization code");
            return Err(ApiError::invalid_code());
        }
        (None, None) => {
            return Err(ApiError::from(AppError::RemoteUnavailable {
                service: "github",
                message: "token response carried neither token nor error".into(),
            }));
        }
    };

    // Fetch the provider profile.
    let github_user: GithubUser = client
        .get(GITHUB_USER_URL)
        .bearer_auth(&access_token)
        .header(header::USER_AGENT, "clawdfather")
        .timeout(state.config.request_timeout)
        .send()
        .await
        .map_err(|e| {
            ApiError::from(AppError::RemoteUnavailable {
                service: "github",
                message: e.to_string(),
            })
        })?
        .json()
        .await
        .map_err(|e| {
            ApiError::from(AppError::RemoteUnavailable {
                service: "github",
                message: format!("unparseable user profile: {e}"),
            })
        })?;

    // Link or refresh the identity, then seal the provider token under the
    // resolved account's KEK.
    let (account, is_new) = state
        .store
        .upsert_oauth_account(NewOAuthIdentity {
            candidate_account_id: Uuid::new_v4(),
            provider: "github".to_string(),
            provider_user_id: github_user.id.to_string(),
            provider_username: github_user.login.clone(),
            provider_email: github_user.email.clone(),
            access_token_ciphertext: String::new(),
            scopes: token_data.scope.unwrap_or_default(),
        })
        .await?;

    let kek = state.master_key.derive_kek(account.id);
    let sealed = crypto::seal(&kek, access_token.as_bytes())?;
    state
        .store
        .update_oauth_token("github", &github_user.id.to_string(), &sealed)
        .await?;

    let issued = state
        .store
        .issue_token(
            NewToken {
                account_id: account.id,
                bound_session_id: None,
                client_ip: client_ip(&headers),
                user_agent: user_agent(&headers),
                ttl: state.config.token_ttl,
            },
            now,
        )
        .await?;

    info!(account_id = %account.id, login = %github_user.login, is_new, "github login");
    state.audit(
        account.id,
        "auth.login",
        json!({ "provider": "github", "new_account": is_new }),
    );

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));

    if wants_json {
        return Ok(Json(json!({
            "token": issued.plaintext,
            "account": account,
        }))
        .into_response());
    }

    let secure = state.config.web_domain.starts_with("https://");
    let cookie = session_cookie(
        &issued.plaintext,
        state.config.token_ttl.as_secs() as i64,
        secure,
    );
    Ok((
        [(header::SET_COOKIE, cookie)],
        Redirect::temporary("/"),
    )
        .into_response())
}

/// `DELETE /api/v1/auth/session` — revoke the caller's token.
pub async fn logout(State(state): State<AppState>, auth: AuthAccount) -> ApiResult<Response> {
    state.store.revoke_token(auth.token.id, Utc::now()).await?;
    state.audit(auth.account.id, "auth.logout", json!({}));

    let cookie = session_cookie("", 0, false);
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true })),
    )
        .into_response())
}

/// `GET /api/v1/auth/me` — account profile plus linked providers.
pub async fn me(State(state): State<AppState>, auth: AuthAccount) -> ApiResult<Json<Value>> {
    let identities = state.store.list_oauth_identities(auth.account.id).await?;
    let providers: Vec<Value> = identities
        .iter()
        .map(|i| {
            json!({
                "provider": i.provider,
                "username": i.provider_username,
                "email": i.provider_email,
            })
        })
        .collect();

    Ok(Json(json!({
        "account": auth.account,
        "providers": providers,
    })))
}
