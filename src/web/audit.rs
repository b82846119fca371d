//! Paginated audit-log listing.

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::state::AppState;
use crate::store::AUDIT_PAGE_LIMIT;
use crate::web::error::ApiResult;
use crate::web::extractors::AuthAccount;

const DEFAULT_LIMIT: usize = 50;

#[derive(Deserialize, Default)]
pub struct AuditQuery {
    /// Cursor: entries strictly older than this timestamp.
    #[serde(default)]
    before: Option<DateTime<Utc>>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// `GET /api/v1/audit?before=&action=&limit=` — newest first, cursor on
/// `created_at`, `limit` capped at 100.
pub async fn list_audit(
    State(state): State<AppState>,
    auth: AuthAccount,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, AUDIT_PAGE_LIMIT);

    // Fetch one extra row to learn whether a further page exists.
    let mut entries = state
        .store
        .list_audit(
            auth.account.id,
            query.before,
            query.action.as_deref(),
            limit + 1,
        )
        .await?;

    let has_more = entries.len() > limit;
    entries.truncate(limit);
    let next_before = has_more
        .then(|| entries.last().map(|e| e.created_at))
        .flatten();

    Ok(Json(json!({
        "entries": entries,
        "has_more": has_more,
        "next_before": next_before,
    })))
}
