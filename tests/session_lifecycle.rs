//! Bootstrap → confirm → terminate, including the guarded preconditions
//! and the launch-failure rollback.

mod helpers;

use chrono::Utc;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use clawdfather::error::AppError;
use clawdfather::sessions::manager::BootstrapStatus;
use clawdfather::ssh::ProbeOutcome;
use clawdfather::store::{LeaseStatus, TestResult};
use helpers::Harness;

#[tokio::test]
async fn bootstrap_rejects_invalid_usernames() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;

    for bad in ["Root!", "UPPER", "0start", "with space", ""] {
        let err = h
            .manager
            .bootstrap(&account, "1.2.3.4", bad, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, AppError::Validation(_)),
            "{bad:?} must be rejected"
        );
    }
    // Nothing was created along the way.
    assert!(h.store.list_connections(account.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn bootstrap_creates_keypair_and_connection_lazily() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    assert!(h.store.list_keys(account.id).await.unwrap().is_empty());

    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    assert_eq!(outcome.status, BootstrapStatus::NeedsSetup);
    let command = outcome.install_command.expect("install command");
    assert!(command.starts_with("mkdir -p ~/.ssh && echo 'ssh-ed25519 "));
    assert!(command.ends_with("chmod 600 ~/.ssh/authorized_keys"));
    assert!(!command.contains('\n'));

    let keys = h.store.list_keys(account.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    let connections = h.store.list_connections(account.id).await.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].port, 22);

    // Same target again: no duplicates, still needs setup.
    let again = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();
    assert_eq!(again.connection_id, outcome.connection_id);
    assert_eq!(h.store.list_connections(account.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn bootstrap_reports_ready_after_a_passing_test() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    h.store
        .record_connection_test(
            outcome.connection_id,
            TestResult::Ok,
            Some("SHA256:abc"),
            Some("ssh-ed25519 AAAAhost"),
            false,
            Utc::now(),
        )
        .await
        .unwrap();

    let ready = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();
    assert_eq!(ready.status, BootstrapStatus::Ready);
    assert!(ready.install_command.is_none());
}

#[tokio::test]
async fn confirm_rejects_revoked_keypair_before_probing() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    // Revoke the connection's keypair (a second key keeps last_key from
    // firing).
    let keys = h.store.list_keys(account.id).await.unwrap();
    let original = &keys[0];
    h.store
        .add_key(clawdfather::store::NewKeypair {
            id: Uuid::new_v4(),
            account_id: account.id,
            label: "spare".to_string(),
            public_key_openssh: "ssh-ed25519 AAAAspare".to_string(),
            fingerprint: "SHA256:spare".to_string(),
            private_key_ciphertext: "sealed".to_string(),
        })
        .await
        .unwrap();
    h.store.remove_key(account.id, original.id).await.unwrap();

    let err = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Conflict {
            code: "keypair_revoked",
            ..
        }
    ));

    // No lease was inserted and the prober never ran.
    assert!(h.store.list_leases(account.id).await.unwrap().is_empty());
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn confirm_requires_credit_before_probing() {
    let h = Harness::new();
    let account = h.account_with_credits(0).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    let err = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Conflict {
            code: "insufficient_credits",
            ..
        }
    ));
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn confirm_enforces_the_session_cap() {
    let h = Harness::new();
    let account = h.account_with_credits(36000).await;
    for host in ["a.example", "b.example", "c.example"] {
        h.start_session(&account, host).await;
    }

    let outcome = h
        .manager
        .bootstrap(&account, "d.example", "deploy", None)
        .await
        .unwrap();
    let err = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
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
async fn confirm_persists_probe_failures() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    h.prober.set(ProbeOutcome::Failed {
        message: "Permission denied (publickey)".to_string(),
    });
    let err = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SshConnect(_)));

    let connection = h
        .store
        .get_connection(account.id, outcome.connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.last_test_result, Some(TestResult::Failed));
    assert!(h.store.list_leases(account.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn confirm_rolls_back_on_launch_failure() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    h.launcher.fail.store(true, Ordering::SeqCst);
    let err = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SshLaunch(_)));

    let leases = h.store.list_leases(account.id).await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].status, LeaseStatus::Failed);
    assert_eq!(leases[0].termination_reason.as_deref(), Some("launch_failed"));

    // The half-started session left nothing behind: the cap is free again
    // and the account_sessions row is closed.
    assert_eq!(h.store.count_active_leases(account.id).await.unwrap(), 0);
    assert!(
        h.store
            .get_account_id_for_session(leases[0].id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn confirm_launches_and_pins_the_host_key() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let outcome = h
        .manager
        .bootstrap(&account, "1.2.3.4", "deploy", None)
        .await
        .unwrap();

    let confirm = h
        .manager
        .confirm(&account, outcome.connection_id, None, None, Utc::now())
        .await
        .unwrap();

    assert_eq!(confirm.lease.status, LeaseStatus::Active);
    assert!(confirm.chat_url.ends_with(&format!("/ws/sessions/{}", confirm.lease.id)));
    assert_eq!(confirm.chat_token.len(), 64);

    // Probe success pinned the host key on first contact.
    let connection = h
        .store
        .get_connection(account.id, outcome.connection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.last_test_result, Some(TestResult::Ok));
    assert!(connection.pinned_host_key_fingerprint.is_some());

    // The chat token resolves and is bound to the session.
    let (_, record) = h
        .store
        .get_account_by_token(&confirm.chat_token, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.bound_session_id, Some(confirm.lease.id));
}

#[tokio::test]
async fn terminate_tears_everything_down() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let (session_id, chat_token) = h.start_session(&account, "1.2.3.4").await;
    let socket = h.registry.get(session_id).unwrap().control_socket_path();
    assert!(socket.exists());

    let terminated = h
        .manager
        .terminate(session_id, "user_request", Utc::now())
        .await
        .unwrap();
    assert!(terminated);

    assert!(!socket.exists(), "control socket must be gone");
    assert!(h.registry.get(session_id).is_none());
    let lease = h.store.get_lease(session_id).await.unwrap().unwrap();
    assert_eq!(lease.status, LeaseStatus::Ended);
    assert_eq!(lease.termination_reason.as_deref(), Some("user_request"));
    assert!(
        h.store
            .get_account_by_token(&chat_token, Utc::now())
            .await
            .unwrap()
            .is_none()
    );

    // Terminating again is a no-op rather than an error.
    let again = h
        .manager
        .terminate(session_id, "user_request", Utc::now())
        .await
        .unwrap();
    assert!(again);
}

#[tokio::test]
async fn messages_flow_through_the_session_pump() {
    let h = Harness::new();
    let account = h.account_with_credits(100).await;
    let (session_id, _) = h.start_session(&account, "1.2.3.4").await;

    let mut events = h.registry.add_peer(session_id).unwrap();
    h.manager
        .send_message(session_id, "uptime".to_string(), Utc::now())
        .await
        .unwrap();

    // thinking → assistant message → done
    use clawdfather::sessions::SessionEvent;
    let first = events.recv().await.unwrap();
    assert!(matches!(first, SessionEvent::Status { status: "thinking" }));
    let second = events.recv().await.unwrap();
    match second {
        SessionEvent::Message { role, text } => {
            assert_eq!(role, "assistant");
            assert_eq!(text, "ran: uptime\n");
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
    let third = events.recv().await.unwrap();
    assert!(matches!(third, SessionEvent::Status { status: "done" }));
}
