//! HTTP surface assembly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{Router, extract::State};
use serde_json::json;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::web::{audit, auth, connections, keys, sessions, stripe, ws};

/// Build the application router: `/health` and the chat WebSocket at the
/// root, everything else under `/api/v1`.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/oauth/github/start", post(auth::oauth_start))
        .route("/auth/oauth/github/callback", get(auth::oauth_callback))
        .route("/auth/session", delete(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/keys", get(keys::list_keys).post(keys::create_key))
        .route("/keys/{id}", delete(keys::remove_key))
        .route("/keys/{id}/install-command", get(keys::key_install_command))
        .route(
            "/connections",
            get(connections::list_connections).post(connections::create_connection),
        )
        .route(
            "/connections/{id}",
            get(connections::get_connection)
                .patch(connections::patch_connection)
                .delete(connections::delete_connection),
        )
        .route("/connections/{id}/test", post(connections::test_connection))
        .route("/sessions/bootstrap", post(sessions::bootstrap))
        .route(
            "/sessions/bootstrap/{conn_id}/confirm",
            post(sessions::confirm),
        )
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/{id}", delete(sessions::terminate_session))
        .route("/audit", get(audit::list_audit))
        .route("/webhooks/stripe", post(stripe::webhook));

    Router::new()
        .route("/health", get(health))
        .route("/ws/sessions/{id}", get(ws::session_ws))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .with_state(state)
}

/// `GET /health` — no auth; 503 while the store is unreachable.
async fn health(State(state): State<AppState>) -> Response {
    let db_ok = state.store.ping().await.is_ok();
    let body = Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "active_sessions": state.registry.len(),
        "db": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.uptime_secs(),
    }));
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body).into_response()
}
