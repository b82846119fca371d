//! Stripe webhook: signature verification over the raw body, then an
//! idempotent credit grant keyed by event id.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::web::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Deserialize)]
struct StripeEventData {
    object: Value,
}

/// Verify a `Stripe-Signature` header (`t=…,v1=…`) against the raw
/// payload. Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now_ts: i64,
) -> Result<(), String> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in signature_header.split(',') {
        let mut split = part.trim().splitn(2, '=');
        match (split.next(), split.next()) {
            (Some("t"), Some(value)) => {
                timestamp = value.parse().ok();
            }
            (Some("v1"), Some(value)) => {
                if let Ok(sig) = hex::decode(value) {
                    candidates.push(sig);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or("missing timestamp in signature header")?;
    if (now_ts - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(format!(
            "signature timestamp outside tolerance ({}s)",
            (now_ts - timestamp).abs()
        ));
    }
    if candidates.is_empty() {
        return Err("no v1 signature present".into());
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "webhook secret is not a usable key".to_string())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    for candidate in &candidates {
        if mac.clone().verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }
    Err("no signature matched".into())
}

/// `POST /api/v1/webhooks/stripe` — raw body, no bearer auth.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let Some(secret) = state.config.stripe_webhook_secret.as_deref() else {
        error!("stripe webhook received but no webhook secret is configured");
        return Err(ApiError::internal());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("missing Stripe-Signature header"))?;

    let now = Utc::now();
    if let Err(reason) = verify_signature(&body, signature, secret, now.timestamp()) {
        warn!(reason, "stripe signature verification failed");
        return Err(ApiError::validation("signature verification failed"));
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("unparseable event payload: {e}")))?;

    if state.store.has_processed_stripe_event(&event.id).await? {
        info!(event_id = %event.id, "stripe event replayed, skipping");
        return Ok(Json(json!({
            "processed": false,
            "event_type": event.event_type,
        })));
    }

    if event.event_type == "checkout.session.completed" {
        apply_checkout_completed(&state, &event).await?;
    }

    // Every event type is recorded so replays are absorbed. A failure
    // after a successful grant must not bubble into a non-2xx, or the
    // provider retries what the idempotency ledger would reject anyway.
    if let Err(e) = state
        .store
        .record_stripe_event(&event.id, &event.event_type, now)
        .await
    {
        error!(event_id = %event.id, error = %e, "failed to record stripe event after processing");
    }

    Ok(Json(json!({
        "processed": true,
        "event_type": event.event_type,
    })))
}

/// Grant the purchased credit-seconds from the checkout metadata.
/// Malformed metadata is logged and dropped rather than bounced: Stripe
/// would retry forever and the payload will not improve.
async fn apply_checkout_completed(state: &AppState, event: &StripeEvent) -> ApiResult<()> {
    let metadata = event.data.object.get("metadata");
    let account_id = metadata
        .and_then(|m| m.get("accountId"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());
    let credit_seconds = metadata
        .and_then(|m| m.get("creditSeconds"))
        .and_then(|v| match v {
            Value::String(s) => s.parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .filter(|s| *s > 0);

    let (Some(account_id), Some(credit_seconds)) = (account_id, credit_seconds) else {
        warn!(event_id = %event.id, "checkout completed without usable metadata");
        return Ok(());
    };

    match state
        .store
        .add_credits(
            account_id,
            credit_seconds,
            "stripe_payment",
            &event.id,
            Utc::now(),
        )
        .await
    {
        Ok(balance) => {
            info!(event_id = %event.id, %account_id, credit_seconds, balance, "credits granted");
            state.audit(
                account_id,
                "credits.grant",
                json!({ "seconds": credit_seconds, "event_id": event.id }),
            );
            Ok(())
        }
        // An unknown account is a metadata problem, not a transient fault;
        // absorb it so the event still gets recorded.
        Err(AppError::NotFound(_)) | Err(AppError::Validation(_)) => {
            warn!(event_id = %event.id, %account_id, "credit grant dropped: bad account or amount");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={now},v1={}", sign(payload, now));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={now},v1={}", sign(payload, now));
        assert!(verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, now).is_err());
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = br#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = format!("t={signed_at},v1={}", sign(payload, signed_at));
        assert!(verify_signature(payload, &header, SECRET, signed_at + 301).is_err());
        assert!(verify_signature(payload, &header, SECRET, signed_at + 299).is_ok());
    }

    #[test]
    fn missing_parts_fail() {
        let payload = b"{}";
        assert!(verify_signature(payload, "v1=abcd", SECRET, 0).is_err());
        assert!(verify_signature(payload, "t=0", SECRET, 0).is_err());
        assert!(verify_signature(payload, "", SECRET, 0).is_err());
    }

    #[test]
    fn second_v1_candidate_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={now},v1=deadbeef,v1={}", sign(payload, now));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }
}
