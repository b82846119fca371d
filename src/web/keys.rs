//! Keypair CRUD. Private keys are generated server-side and only ever
//! stored sealed; responses expose the public half and fingerprint.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::crypto;
use crate::ssh::install_command;
use crate::state::AppState;
use crate::store::NewKeypair;
use crate::web::error::{ApiError, ApiResult};
use crate::web::extractors::AuthAccount;

/// `GET /api/v1/keys`
pub async fn list_keys(State(state): State<AppState>, auth: AuthAccount) -> ApiResult<Json<Value>> {
    let keys = state.store.list_keys(auth.account.id).await?;
    Ok(Json(json!({ "keys": keys })))
}

#[derive(Deserialize, Default)]
pub struct CreateKeyRequest {
    #[serde(default)]
    label: Option<String>,
}

/// `POST /api/v1/keys` — generate a fresh Ed25519 keypair for the account.
pub async fn create_key(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<CreateKeyRequest>,
) -> ApiResult<Response> {
    let label = req.label.unwrap_or_else(|| "default".to_string());
    if label.is_empty() || label.len() > 64 {
        return Err(ApiError::validation("label must be 1-64 characters"));
    }

    let generated = crypto::generate_keypair(&format!("clawdfather:{}", auth.account.id));
    let kek = state.master_key.derive_kek(auth.account.id);
    let ciphertext = crypto::seal(&kek, generated.private_key_openssh.as_bytes())?;

    let keypair = state
        .store
        .add_key(NewKeypair {
            id: Uuid::new_v4(),
            account_id: auth.account.id,
            label,
            public_key_openssh: generated.public_key_openssh,
            fingerprint: generated.fingerprint,
            private_key_ciphertext: ciphertext,
        })
        .await?;

    state.audit(
        auth.account.id,
        "key.create",
        json!({ "key_id": keypair.id, "fingerprint": keypair.fingerprint }),
    );
    Ok((StatusCode::CREATED, Json(json!({ "key": keypair }))).into_response())
}

/// `DELETE /api/v1/keys/:id` — revoke; refuses to orphan the account.
pub async fn remove_key(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.store.remove_key(auth.account.id, key_id).await?;
    state.audit(auth.account.id, "key.revoke", json!({ "key_id": key_id }));
    Ok(Json(json!({ "ok": true })))
}

/// `GET /api/v1/keys/:id/install-command`
pub async fn key_install_command(
    State(state): State<AppState>,
    auth: AuthAccount,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let key = state
        .store
        .get_key(auth.account.id, key_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key not found"))?;
    Ok(Json(json!({
        "command": install_command(&key.public_key_openssh)
    })))
}
