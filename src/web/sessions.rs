//! Session lifecycle endpoints: bootstrap, confirm, list, terminate.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::sessions::reason;
use crate::state::AppState;
use crate::web::error::{ApiError, ApiResult};
use crate::web::extractors::{AuthAccount, client_ip, user_agent};

#[derive(Deserialize)]
pub struct BootstrapRequest {
    host: String,
    username: String,
    #[serde(default)]
    port: Option<u16>,
}

/// `POST /api/v1/sessions/bootstrap`
pub async fn bootstrap(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<BootstrapRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .manager
        .bootstrap(&auth.account, &req.host, &req.username, req.port)
        .await?;

    state.audit(
        auth.account.id,
        "session.bootstrap",
        json!({ "connection_id": outcome.connection_id, "status": outcome.status }),
    );
    Ok(Json(json!({
        "status": outcome.status,
        "connection_id": outcome.connection_id,
        "install_command": outcome.install_command,
    })))
}

/// `POST /api/v1/sessions/bootstrap/:conn_id/confirm`
pub async fn confirm(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(conn_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let outcome = state
        .manager
        .confirm(
            &auth.account,
            conn_id,
            client_ip(&headers),
            user_agent(&headers),
            Utc::now(),
        )
        .await?;

    state.audit(
        auth.account.id,
        "session.start",
        json!({ "session_id": outcome.lease.id, "connection_id": conn_id }),
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session": {
                "id": outcome.lease.id,
                "status": outcome.lease.status,
                "connection_id": outcome.lease.connection_id,
                "started_at": outcome.lease.started_at,
                "chat_token": outcome.chat_token,
            },
            "chat_url": outcome.chat_url,
        })),
    )
        .into_response())
}

/// `GET /api/v1/sessions` — leases enriched with runtime state for the
/// ones that are actually up.
pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> ApiResult<Json<Value>> {
    let leases = state.store.list_leases(auth.account.id).await?;
    let sessions: Vec<Value> = leases
        .into_iter()
        .map(|lease| {
            let live = state.registry.get(lease.id);
            json!({
                "id": lease.id,
                "connection_id": lease.connection_id,
                "status": lease.status,
                "started_at": lease.started_at,
                "ended_at": lease.ended_at,
                "termination_reason": lease.termination_reason,
                "live": live.is_some(),
                "last_activity": live.as_ref().map(|l| l.last_activity),
                "peers": live.as_ref().map(|l| l.peers),
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": sessions })))
}

/// `DELETE /api/v1/sessions/:id`
pub async fn terminate_session(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let lease = state
        .store
        .get_lease(session_id)
        .await?
        .filter(|l| l.account_id == auth.account.id)
        .ok_or_else(|| ApiError::not_found("session not found"))?;

    state
        .manager
        .terminate(lease.id, reason::USER_REQUEST, Utc::now())
        .await?;

    state.audit(
        auth.account.id,
        "session.terminate",
        json!({ "session_id": session_id }),
    );
    Ok(Json(json!({ "ok": true })))
}
