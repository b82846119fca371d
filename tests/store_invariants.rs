//! Transactional contracts of the account store, exercised on the memory
//! backend (both backends implement the same trait with identical
//! contracts).

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use clawdfather::error::AppError;
use clawdfather::store::{
    DebitOutcome, MemoryStore, NewAccountWithKey, NewKeypair, NewToken, Store,
};
use helpers::{Harness, assert_ledger_consistent, new_identity};

fn new_key(account_id: Uuid, fingerprint: &str) -> NewKeypair {
    NewKeypair {
        id: Uuid::new_v4(),
        account_id,
        label: "test".to_string(),
        public_key_openssh: format!("ssh-ed25519 AAAA{fingerprint}"),
        fingerprint: fingerprint.to_string(),
        private_key_ciphertext: "sealed".to_string(),
    }
}

#[tokio::test]
async fn balance_always_equals_ledger_sum() {
    let h = Harness::new();
    let account = h.account_with_credits(3600).await;
    assert_ledger_consistent(&h.store, account.id).await;

    h.store
        .debit_credits(account.id, 30, Uuid::new_v4(), Utc::now())
        .await
        .unwrap();
    h.store
        .add_credits(account.id, 100, "stripe_payment", "evt_x", Utc::now())
        .await
        .unwrap();
    assert_ledger_consistent(&h.store, account.id).await;

    let account = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.balance_seconds, 3600 - 30 + 100);
}

#[tokio::test]
async fn debit_never_overdraws() {
    let h = Harness::new();
    let account = h.account_with_credits(10).await;

    let outcome = h
        .store
        .debit_credits(account.id, 30, Uuid::new_v4(), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DebitOutcome::InsufficientFunds);

    // Nothing changed: no partial entry, balance intact.
    let account = h.store.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.balance_seconds, 10);
    let debits = h
        .store
        .list_ledger(account.id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.delta_seconds < 0)
        .count();
    assert_eq!(debits, 0);
    assert_ledger_consistent(&h.store, account.id).await;
}

#[tokio::test]
async fn debit_tags_ledger_with_session() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let session_id = Uuid::new_v4();

    let outcome = h
        .store
        .debit_credits(account.id, 30, session_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DebitOutcome::Applied(70));

    let ledger = h.store.list_ledger(account.id).await.unwrap();
    let debit = ledger.iter().find(|e| e.delta_seconds == -30).unwrap();
    assert_eq!(debit.reason, format!("session_debit:{session_id}"));
}

#[tokio::test]
async fn concurrent_fingerprint_resolution_converges() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let fingerprint = "SHA256:sameforeveryone";

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .resolve_or_create_account(NewAccountWithKey {
                    account_id: Uuid::new_v4(),
                    display_name: "racer".to_string(),
                    fingerprint: fingerprint.to_string(),
                    public_key_openssh: "ssh-ed25519 AAAAracer".to_string(),
                    private_key_ciphertext: String::new(),
                    key_label: "paired".to_string(),
                })
                .await
                .unwrap()
        }));
    }

    let mut account_ids = std::collections::HashSet::new();
    let mut creations = 0;
    for handle in handles {
        let resolved = handle.await.unwrap();
        account_ids.insert(resolved.account.id);
        if resolved.is_new {
            creations += 1;
        }
    }
    assert_eq!(account_ids.len(), 1, "all callers must agree on one account");
    assert_eq!(creations, 1, "exactly one caller creates");
}

#[tokio::test]
async fn expired_and_revoked_tokens_never_resolve() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let now = Utc::now();

    // TTL of 1ms, queried 1000ms later: gone.
    let issued = h
        .store
        .issue_token(
            NewToken {
                account_id: account.id,
                bound_session_id: None,
                client_ip: None,
                user_agent: None,
                ttl: Duration::from_millis(1),
            },
            now,
        )
        .await
        .unwrap();
    let later = now + ChronoDuration::milliseconds(1000);
    assert!(
        h.store
            .get_account_by_token(&issued.plaintext, later)
            .await
            .unwrap()
            .is_none()
    );

    // Exactly at expiry is also invalid.
    let at_expiry = now + ChronoDuration::milliseconds(1);
    assert!(
        h.store
            .get_account_by_token(&issued.plaintext, at_expiry)
            .await
            .unwrap()
            .is_none()
    );

    // A long-lived token resolves until revoked, then never again.
    let issued = h
        .store
        .issue_token(
            NewToken {
                account_id: account.id,
                bound_session_id: None,
                client_ip: None,
                user_agent: None,
                ttl: Duration::from_secs(3600),
            },
            now,
        )
        .await
        .unwrap();
    assert!(
        h.store
            .get_account_by_token(&issued.plaintext, now)
            .await
            .unwrap()
            .is_some()
    );
    h.store.revoke_token(issued.record.id, now).await.unwrap();
    assert!(
        h.store
            .get_account_by_token(&issued.plaintext, now)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn clean_expired_tokens_counts_removals() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let now = Utc::now();

    for ttl_ms in [1, 1, 3_600_000] {
        h.store
            .issue_token(
                NewToken {
                    account_id: account.id,
                    bound_session_id: None,
                    client_ip: None,
                    user_agent: None,
                    ttl: Duration::from_millis(ttl_ms),
                },
                now,
            )
            .await
            .unwrap();
    }

    let removed = h
        .store
        .clean_expired_tokens(now + ChronoDuration::seconds(10))
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn last_active_key_cannot_be_removed() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;

    let first = h.store.add_key(new_key(account.id, "SHA256:first")).await.unwrap();
    let err = h.store.remove_key(account.id, first.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict { code: "last_key", .. }));

    // With a second active key the first one can go.
    let second = h.store.add_key(new_key(account.id, "SHA256:second")).await.unwrap();
    h.store.remove_key(account.id, first.id).await.unwrap();

    // The survivor is now the last key again.
    let err = h.store.remove_key(account.id, second.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict { code: "last_key", .. }));
}

#[tokio::test]
async fn remove_key_rejects_foreign_and_missing_keys() {
    let h = Harness::new();
    let owner = h.account_with_credits(0).await;
    let stranger = h.account_with_credits(0).await;
    let key = h.store.add_key(new_key(owner.id, "SHA256:owned")).await.unwrap();

    let err = h.store.remove_key(stranger.id, key.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = h.store.remove_key(owner.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_fingerprints_conflict_within_account() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    h.store.add_key(new_key(account.id, "SHA256:dup")).await.unwrap();
    let err = h
        .store
        .add_key(new_key(account.id, "SHA256:dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));
}

#[tokio::test]
async fn stripe_event_recording_is_idempotent() {
    let h = Harness::new();
    let now = Utc::now();
    assert!(
        h.store
            .record_stripe_event("evt_a", "checkout.session.completed", now)
            .await
            .unwrap()
    );
    assert!(
        !h.store
            .record_stripe_event("evt_a", "checkout.session.completed", now)
            .await
            .unwrap()
    );
    assert!(h.store.has_processed_stripe_event("evt_a").await.unwrap());
    assert!(!h.store.has_processed_stripe_event("evt_b").await.unwrap());
}

#[tokio::test]
async fn oauth_state_is_single_use_and_expires() {
    let h = Harness::new();
    let now = Utc::now();
    let expires = now + ChronoDuration::minutes(10);

    h.store.put_oauth_state("hash-1", "verifier-1", expires).await.unwrap();
    assert_eq!(
        h.store.consume_oauth_state("hash-1", now).await.unwrap(),
        Some("verifier-1".to_string())
    );
    // Second consumption finds nothing.
    assert_eq!(h.store.consume_oauth_state("hash-1", now).await.unwrap(), None);

    // Expired rows do not consume.
    h.store.put_oauth_state("hash-2", "verifier-2", expires).await.unwrap();
    assert_eq!(
        h.store
            .consume_oauth_state("hash-2", expires + ChronoDuration::seconds(1))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn oauth_identity_upsert_reuses_account() {
    let h = Harness::new();
    let identity = new_identity("gh-7");
    let (first, created) = h.store.upsert_oauth_account(identity.clone()).await.unwrap();
    assert!(created);

    let mut again = new_identity("gh-7");
    again.provider_username = "renamed".to_string();
    let (second, created) = h.store.upsert_oauth_account(again).await.unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn session_cap_is_enforced_transactionally() {
    let h = Harness::new();
    let account = h.account_with_credits(3600).await;
    let conn_id = Uuid::new_v4();
    let token = || NewToken {
        account_id: account.id,
        bound_session_id: None,
        client_ip: None,
        user_agent: None,
        ttl: Duration::from_secs(60),
    };

    for _ in 0..3 {
        h.store
            .begin_session(Uuid::new_v4(), account.id, conn_id, 3, token(), Utc::now())
            .await
            .unwrap();
    }
    let err = h
        .store
        .begin_session(Uuid::new_v4(), account.id, conn_id, 3, token(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Conflict {
            code: "session_limit_reached",
            ..
        }
    ));
}

#[tokio::test]
async fn audit_pages_by_cursor_and_action() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let base = Utc::now();
    for i in 0..5i64 {
        h.store
            .append_audit(
                account.id,
                if i % 2 == 0 { "session.start" } else { "key.create" },
                serde_json::json!({ "i": i }),
                base + ChronoDuration::seconds(i),
            )
            .await
            .unwrap();
    }

    // Newest first.
    let page = h.store.list_audit(account.id, None, None, 10).await.unwrap();
    assert_eq!(page.len(), 5);
    assert!(page.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    // Cursor excludes newer-or-equal rows.
    let cursor = page[1].created_at;
    let older = h
        .store
        .list_audit(account.id, Some(cursor), None, 10)
        .await
        .unwrap();
    assert!(older.iter().all(|e| e.created_at < cursor));

    // Action filter.
    let filtered = h
        .store
        .list_audit(account.id, None, Some("key.create"), 10)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|e| e.action == "key.create"));
}
