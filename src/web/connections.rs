//! Connection CRUD and the on-demand connectivity test.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::state::AppState;
use crate::store::ConnectionPatch;
use crate::web::error::{ApiError, ApiResult};
use crate::web::extractors::AuthAccount;

/// `GET /api/v1/connections`
pub async fn list_connections(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> ApiResult<Json<Value>> {
    let connections = state.store.list_connections(auth.account.id).await?;
    Ok(Json(json!({ "connections": connections })))
}

#[derive(Deserialize)]
pub struct CreateConnectionRequest {
    host: String,
    username: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    keypair_id: Option<Uuid>,
}

/// `POST /api/v1/connections`
pub async fn create_connection(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<CreateConnectionRequest>,
) -> ApiResult<Response> {
    // Target validation matches the bootstrap path exactly; a connection
    // that cannot bootstrap should not be creatable here either.
    let keypair = match req.keypair_id {
        Some(id) => {
            let key = state
                .store
                .get_key(auth.account.id, id)
                .await?
                .ok_or_else(|| ApiError::not_found("keypair not found"))?;
            if !key.active {
                return Err(ApiError::from(crate::error::AppError::conflict(
                    "keypair_revoked",
                    "cannot attach a revoked keypair",
                )));
            }
            key
        }
        None => state.manager.ensure_keypair(&auth.account).await?,
    };

    let outcome = state
        .manager
        .bootstrap(&auth.account, &req.host, &req.username, req.port)
        .await?;

    let mut connection = state
        .store
        .get_connection(auth.account.id, outcome.connection_id)
        .await?
        .ok_or_else(|| ApiError::not_found("connection vanished"))?;

    let patch = ConnectionPatch {
        label: req.label,
        keypair_id: (connection.keypair_id != keypair.id).then_some(keypair.id),
    };
    if patch.label.is_some() || patch.keypair_id.is_some() {
        connection = state
            .store
            .update_connection(auth.account.id, connection.id, patch)
            .await?;
    }

    state.audit(
        auth.account.id,
        "connection.create",
        json!({ "connection_id": connection.id, "host": connection.host }),
    );
    Ok((StatusCode::CREATED, Json(json!({ "connection": connection }))).into_response())
}

/// `GET /api/v1/connections/:id`
pub async fn get_connection(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let connection = state
        .store
        .get_connection(auth.account.id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("connection not found"))?;
    Ok(Json(json!({ "connection": connection })))
}

#[derive(Deserialize, Default)]
pub struct PatchConnectionRequest {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    keypair_id: Option<Uuid>,
}

/// `PATCH /api/v1/connections/:id`
pub async fn patch_connection(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(id): Path<Uuid>,
    Json(req): Json<PatchConnectionRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(keypair_id) = req.keypair_id {
        let key = state
            .store
            .get_key(auth.account.id, keypair_id)
            .await?
            .ok_or_else(|| ApiError::not_found("keypair not found"))?;
        if !key.active {
            return Err(ApiError::from(crate::error::AppError::conflict(
                "keypair_revoked",
                "cannot attach a revoked keypair",
            )));
        }
    }
    if let Some(label) = &req.label
        && (label.is_empty() || label.len() > 64)
    {
        return Err(ApiError::validation("label must be 1-64 characters"));
    }

    let connection = state
        .store
        .update_connection(
            auth.account.id,
            id,
            ConnectionPatch {
                label: req.label,
                keypair_id: req.keypair_id,
            },
        )
        .await?;
    Ok(Json(json!({ "connection": connection })))
}

/// `DELETE /api/v1/connections/:id`
pub async fn delete_connection(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.store.delete_connection(auth.account.id, id).await?;
    state.audit(
        auth.account.id,
        "connection.delete",
        json!({ "connection_id": id }),
    );
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize, Default)]
pub struct TestConnectionRequest {
    #[serde(default)]
    accept_host_key: bool,
}

/// `POST /api/v1/connections/:id/test` — run the prober and persist the
/// outcome. `accept_host_key` rotates the pinned host key.
pub async fn test_connection(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(id): Path<Uuid>,
    body: Option<Json<TestConnectionRequest>>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body.unwrap_or_default();
    let connection = state
        .store
        .get_connection(auth.account.id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("connection not found"))?;

    let outcome = state
        .manager
        .test_connection(&auth.account, &connection, req.accept_host_key, Utc::now())
        .await?;

    state.audit(
        auth.account.id,
        "connection.test",
        json!({ "connection_id": id }),
    );
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}
