//! Webhook contract: signature gate, idempotent credit grant, replay
//! absorption.

mod helpers;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use clawdfather::web::stripe::webhook;
use helpers::{Harness, assert_ledger_consistent};

const SECRET: &str = "whsec_test";

fn signed_headers(payload: &[u8]) -> HeaderMap {
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());

    let mut headers = HeaderMap::new();
    headers.insert(
        "stripe-signature",
        format!("t={timestamp},v1={signature}").parse().unwrap(),
    );
    headers
}

fn checkout_payload(event_id: &str, account_id: uuid::Uuid, credit_seconds: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "metadata": {
                    "accountId": account_id.to_string(),
                    "creditSeconds": credit_seconds,
                }
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn duplicate_delivery_credits_exactly_once() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let state = h.app_state();

    let payload = checkout_payload("evt_a", account.id, "7200");

    let first = webhook(
        State(state.clone()),
        signed_headers(&payload),
        Bytes::from(payload.clone()),
    )
    .await
    .unwrap();
    assert_eq!(first.0["processed"], json!(true));
    assert_eq!(first.0["event_type"], json!("checkout.session.completed"));

    let second = webhook(
        State(state),
        signed_headers(&payload),
        Bytes::from(payload),
    )
    .await
    .unwrap();
    assert_eq!(second.0["processed"], json!(false));

    // Wait out the fire-and-forget audit write before reading the ledger.
    tokio::task::yield_now().await;
    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.balance_seconds, 7200);
    assert_ledger_consistent(&h.store, account.id).await;

    let grant = &h.store.list_ledger(account.id).await.unwrap()[0];
    assert_eq!(grant.reason, "stripe_payment");
    assert_eq!(grant.reference, "evt_a");
}

#[tokio::test]
async fn numeric_credit_seconds_also_grant() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let payload = serde_json::to_vec(&json!({
        "id": "evt_num",
        "type": "checkout.session.completed",
        "data": { "object": { "metadata": {
            "accountId": account.id.to_string(),
            "creditSeconds": 600,
        }}}
    }))
    .unwrap();

    webhook(
        State(h.app_state()),
        signed_headers(&payload),
        Bytes::from(payload),
    )
    .await
    .unwrap();

    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.balance_seconds, 600);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_any_effect() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let payload = checkout_payload("evt_bad", account.id, "7200");

    // Sign a different payload.
    let headers = signed_headers(b"something else entirely");
    let err = webhook(State(h.app_state()), headers, Bytes::from(payload))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.code, "validation_error");

    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.balance_seconds, 0);
    assert!(!h.store.has_processed_stripe_event("evt_bad").await.unwrap());
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let h = Harness::new();
    let payload = b"{}".to_vec();
    let err = webhook(State(h.app_state()), HeaderMap::new(), Bytes::from(payload))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unconfigured_secret_is_a_server_error() {
    let h = Harness::new();
    let mut config = helpers::test_config(std::env::temp_dir());
    config.stripe_webhook_secret = None;
    let state = clawdfather::state::AppState::new(
        h.store.clone(),
        h.registry.clone(),
        h.manager.clone(),
        std::sync::Arc::new(config),
    );

    let payload = b"{}".to_vec();
    let err = webhook(State(state), signed_headers(&payload), Bytes::from(payload))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn unhandled_event_types_are_recorded_but_noop() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let payload = serde_json::to_vec(&json!({
        "id": "evt_other",
        "type": "invoice.paid",
        "data": { "object": {} }
    }))
    .unwrap();

    let response = webhook(
        State(h.app_state()),
        signed_headers(&payload),
        Bytes::from(payload.clone()),
    )
    .await
    .unwrap();
    assert_eq!(response.0["processed"], json!(true));

    // Recorded, so a replay short-circuits.
    let replay = webhook(
        State(h.app_state()),
        signed_headers(&payload),
        Bytes::from(payload),
    )
    .await
    .unwrap();
    assert_eq!(replay.0["processed"], json!(false));

    let refreshed = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.balance_seconds, 0);
}

#[tokio::test]
async fn malformed_metadata_is_absorbed() {
    let h = Harness::new();
    let payload = serde_json::to_vec(&json!({
        "id": "evt_meta",
        "type": "checkout.session.completed",
        "data": { "object": { "metadata": {
            "accountId": "not-a-uuid",
            "creditSeconds": "-5",
        }}}
    }))
    .unwrap();

    let response = webhook(
        State(h.app_state()),
        signed_headers(&payload),
        Bytes::from(payload),
    )
    .await
    .unwrap();
    // Still recorded so Stripe stops retrying a payload that will never
    // parse better.
    assert_eq!(response.0["processed"], json!(true));
    assert!(h.store.has_processed_stripe_event("evt_meta").await.unwrap());
}
