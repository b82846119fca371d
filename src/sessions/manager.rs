//! Session lifecycle orchestration: bootstrap → confirm → launch →
//! terminate, plus the idle sweep.
//!
//! Each lease walks a small state machine (pending → active → ended, with
//! failed off the pending edge). The lease id doubles as the session id
//! everywhere: registry key, control-socket name, token binding.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{self, MasterKey};
use crate::error::{AppError, Result};
use crate::sessions::registry::{LiveSession, SessionRegistry};
use crate::sessions::{SessionEvent, reason};
use crate::ssh::{
    ConnectionProber, ControlChannel, ControlLauncher, ControlTarget, ProbeOutcome, ProbeTarget,
    install_command,
};
use crate::store::{
    Account, Connection, Keypair, LeaseStatus, NewKeypair, NewToken, SessionLease, Store,
    TestResult,
};

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]{0,254}$").expect("valid regex"));

/// Grace period given to a control master between `-O exit` and a signal.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Events waiting in a session's inbound queue before senders back off.
const INBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Ready,
    NeedsSetup,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapOutcome {
    pub status: BootstrapStatus,
    pub connection_id: Uuid,
    pub install_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub lease: SessionLease,
    pub chat_url: String,
    /// Session-bound bearer token for the WebSocket client. Surfaced
    /// exactly once.
    pub chat_token: String,
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    prober: Arc<dyn ConnectionProber>,
    launcher: Arc<dyn ControlLauncher>,
    master_key: MasterKey,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        prober: Arc<dyn ConnectionProber>,
        launcher: Arc<dyn ControlLauncher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            prober,
            launcher,
            master_key: MasterKey::new(config.master_key.clone()),
            config,
        }
    }

    /// Fetch the account's active keypair, lazily generating one when the
    /// account has none.
    pub async fn ensure_keypair(&self, account: &Account) -> Result<Keypair> {
        if let Some(existing) = self.store.get_active_keypair(account.id).await? {
            return Ok(existing);
        }
        let generated = crypto::generate_keypair(&format!("clawdfather:{}", account.id));
        let kek = self.master_key.derive_kek(account.id);
        let ciphertext = crypto::seal(&kek, generated.private_key_openssh.as_bytes())?;
        let keypair = self
            .store
            .add_key(NewKeypair {
                id: Uuid::new_v4(),
                account_id: account.id,
                label: "default".to_string(),
                public_key_openssh: generated.public_key_openssh,
                fingerprint: generated.fingerprint,
                private_key_ciphertext: ciphertext,
            })
            .await?;
        info!(account_id = %account.id, fingerprint = %keypair.fingerprint, "generated account keypair");
        Ok(keypair)
    }

    /// `POST /sessions/bootstrap`: validate the target, make sure a
    /// keypair and a connection row exist, and tell the caller whether the
    /// host still needs the key installed.
    pub async fn bootstrap(
        &self,
        account: &Account,
        host: &str,
        username: &str,
        port: Option<u16>,
    ) -> Result<BootstrapOutcome> {
        if !USERNAME_RE.is_match(username) {
            return Err(AppError::validation(
                "username must match ^[a-z_][a-z0-9_-]{0,31}$",
            ));
        }
        if !HOST_RE.is_match(host) {
            return Err(AppError::validation("host is not a valid hostname"));
        }
        let port = match port {
            Some(0) => return Err(AppError::validation("port must be nonzero")),
            Some(p) => p,
            None => self.config.ssh_port,
        };

        let keypair = self.ensure_keypair(account).await?;

        let connection = match self
            .store
            .find_connection(account.id, host, port, username)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.store
                    .create_connection(crate::store::NewConnection {
                        id: Uuid::new_v4(),
                        account_id: account.id,
                        keypair_id: keypair.id,
                        host: host.to_string(),
                        port,
                        username: username.to_string(),
                        label: host.to_string(),
                    })
                    .await?
            }
        };

        if connection.last_test_result == Some(TestResult::Ok) {
            return Ok(BootstrapOutcome {
                status: BootstrapStatus::Ready,
                connection_id: connection.id,
                install_command: None,
            });
        }

        // The connection may reference an older keypair; the install
        // command must carry the key the session will authenticate with.
        let conn_key = self
            .store
            .get_key(account.id, connection.keypair_id)
            .await?
            .unwrap_or(keypair);

        Ok(BootstrapOutcome {
            status: BootstrapStatus::NeedsSetup,
            connection_id: connection.id,
            install_command: Some(install_command(&conn_key.public_key_openssh)),
        })
    }

    /// `POST /sessions/bootstrap/:connId/confirm`: ordered precondition
    /// checks, probe, then the transactional session start and control
    /// master launch.
    pub async fn confirm(
        &self,
        account: &Account,
        connection_id: Uuid,
        client_ip: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let connection = self
            .store
            .get_connection(account.id, connection_id)
            .await?
            .ok_or_else(|| AppError::not_found("connection not found"))?;

        let keypair = self
            .store
            .get_key(account.id, connection.keypair_id)
            .await?
            .ok_or_else(|| AppError::not_found("connection keypair missing"))?;
        if !keypair.active {
            return Err(AppError::conflict(
                "keypair_revoked",
                "the keypair for this connection has been revoked",
            ));
        }

        let fresh = self
            .store
            .get_account(account.id)
            .await?
            .ok_or_else(|| AppError::not_found("account not found"))?;
        if fresh.balance_seconds < 1 {
            return Err(AppError::conflict(
                "insufficient_credits",
                "credit balance is empty",
            ));
        }

        if self.store.count_active_leases(account.id).await? >= self.config.session_cap {
            return Err(AppError::conflict(
                "session_limit_reached",
                format!(
                    "at most {} concurrent sessions per account",
                    self.config.session_cap
                ),
            ));
        }

        let kek = self.master_key.derive_kek(account.id);
        let private_key = crypto::open(&kek, &keypair.private_key_ciphertext)?;
        let private_key = String::from_utf8(private_key)
            .map_err(|_| AppError::Crypto("decrypted key is not utf-8".into()))?;

        let outcome = self
            .prober
            .probe(ProbeTarget {
                host: &connection.host,
                port: connection.port,
                username: &connection.username,
                private_key_openssh: &private_key,
                expected_fingerprint: connection.pinned_host_key_fingerprint.as_deref(),
                timeout: self.config.request_timeout,
            })
            .await;

        let (host_key_fingerprint, host_key) = match outcome {
            ProbeOutcome::Ok {
                host_key_fingerprint,
                host_key,
                ..
            } => {
                self.store
                    .record_connection_test(
                        connection.id,
                        TestResult::Ok,
                        Some(&host_key_fingerprint),
                        Some(&host_key),
                        false,
                        now,
                    )
                    .await?;
                (host_key_fingerprint, host_key)
            }
            ProbeOutcome::HostKeyChanged {
                old_fingerprint,
                new_fingerprint,
            } => {
                self.store
                    .record_connection_test(
                        connection.id,
                        TestResult::HostKeyChanged,
                        None,
                        None,
                        false,
                        now,
                    )
                    .await?;
                return Err(AppError::SshConnect(format!(
                    "host key changed: expected {old_fingerprint}, host presented {new_fingerprint}"
                )));
            }
            ProbeOutcome::Failed { message } => {
                self.store
                    .record_connection_test(connection.id, TestResult::Failed, None, None, false, now)
                    .await?;
                return Err(AppError::SshConnect(message));
            }
            ProbeOutcome::Timeout { message } => {
                self.store
                    .record_connection_test(connection.id, TestResult::Timeout, None, None, false, now)
                    .await?;
                return Err(AppError::SshConnect(message));
            }
        };

        let session_id = Uuid::new_v4();
        let (lease, token) = self
            .store
            .begin_session(
                session_id,
                account.id,
                connection.id,
                self.config.session_cap,
                NewToken {
                    account_id: account.id,
                    bound_session_id: Some(session_id),
                    client_ip,
                    user_agent,
                    ttl: self.config.token_ttl,
                },
                now,
            )
            .await?;

        let pinned = connection.pinned_host_key.clone().unwrap_or(host_key);
        let launch = self
            .launcher
            .launch(ControlTarget {
                session_id,
                host: connection.host.clone(),
                port: connection.port,
                username: connection.username.clone(),
                private_key_openssh: private_key,
                pinned_host_key: Some(pinned),
            })
            .await;

        let control = match launch {
            Ok(control) => control,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "control master launch failed");
                self.store
                    .update_lease_status(session_id, LeaseStatus::Failed, Some(reason::LAUNCH_FAILED), now)
                    .await?;
                self.store.revoke_token(token.record.id, now).await?;
                self.store.end_account_session(session_id, now).await?;
                return Err(e);
            }
        };

        self.store
            .update_lease_status(session_id, LeaseStatus::Active, None, now)
            .await?;

        let (events, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        self.spawn_pump(session_id, control.clone(), events.clone(), inbound_rx);

        let live = LiveSession {
            session_id,
            account_id: account.id,
            connection_id: connection.id,
            control,
            started_at: now,
            last_activity: now,
            peers: 0,
            events,
            inbound: inbound_tx,
        };
        if self.registry.create(live).is_err() {
            // A stale entry under the same id means the runtime state is
            // unsound; refuse rather than double-run.
            self.terminate(session_id, reason::LAUNCH_FAILED, now).await?;
            return Err(AppError::SshLaunch(
                "a live session with this id already exists".into(),
            ));
        }

        info!(session_id = %session_id, account_id = %account.id, fingerprint = %host_key_fingerprint, "session active");

        let mut active = lease;
        active.status = LeaseStatus::Active;
        Ok(ConfirmOutcome {
            lease: active,
            chat_url: format!("{}/ws/sessions/{}", self.config.web_domain, session_id),
            chat_token: token.plaintext,
        })
    }

    /// Tear a session down, whatever initiated it. Safe to call for ids
    /// that are only half-alive (registry without lease or vice versa).
    pub async fn terminate(&self, session_id: Uuid, reason_tag: &str, now: DateTime<Utc>) -> Result<bool> {
        let live = self.registry.remove(session_id);
        let lease = self.store.get_lease(session_id).await?;
        if live.is_none() && lease.is_none() {
            return Ok(false);
        }

        if let Some(live) = live {
            let _ = live.events.send(SessionEvent::SessionClosed {
                reason: reason_tag.to_string(),
                message: closure_message(reason_tag).to_string(),
            });
            live.control.stop(TERMINATE_GRACE).await;
        }

        if let Some(lease) = lease
            && !matches!(lease.status, LeaseStatus::Ended | LeaseStatus::Failed)
        {
            self.store
                .update_lease_status(session_id, LeaseStatus::Ended, Some(reason_tag), now)
                .await?;
        }

        self.store.end_account_session(session_id, now).await?;
        self.store.revoke_tokens_by_session(session_id, now).await?;

        info!(session_id = %session_id, reason = reason_tag, "session terminated");
        Ok(true)
    }

    /// Terminate sessions whose idle age exceeds the configured threshold.
    /// Returns the count. Runs at the ticker cadence.
    pub async fn idle_sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(self.config.session_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let mut swept = 0;
        for live in self.registry.list() {
            if now - live.last_activity >= cutoff {
                if self.terminate(live.session_id, reason::IDLE_TIMEOUT, now).await? {
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    /// Terminate everything, for graceful shutdown.
    pub async fn shutdown_all(&self, now: DateTime<Utc>) {
        for live in self.registry.list() {
            if let Err(e) = self.terminate(live.session_id, reason::SHUTDOWN, now).await {
                error!(session_id = %live.session_id, error = %e, "failed to terminate on shutdown");
            }
        }
    }

    /// Queue an inbound chat line for the session's pump and record the
    /// activity.
    pub async fn send_message(&self, session_id: Uuid, text: String, now: DateTime<Utc>) -> Result<()> {
        let live = self
            .registry
            .get(session_id)
            .ok_or_else(|| AppError::not_found("session not live"))?;
        self.registry.touch(session_id, now);
        live.inbound
            .send(text)
            .await
            .map_err(|_| AppError::not_found("session pump stopped"))
    }

    /// Per-session message pump: each inbound line runs over the
    /// multiplexed channel; output fans out to peers framed by
    /// thinking/done status events.
    fn spawn_pump(
        &self,
        session_id: Uuid,
        control: Arc<dyn ControlChannel>,
        events: broadcast::Sender<SessionEvent>,
        mut inbound: mpsc::Receiver<String>,
    ) {
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                let _ = events.send(SessionEvent::Status { status: "thinking" });
                let reply = match control.run(&line, timeout).await {
                    Ok(stdout) => stdout,
                    Err(e) => format!("command failed: {e}"),
                };
                let _ = events.send(SessionEvent::Message {
                    role: "assistant",
                    text: reply,
                });
                let _ = events.send(SessionEvent::Status { status: "done" });
            }
            tracing::debug!(session_id = %session_id, "message pump stopped");
        });
    }

    /// Run a prober pass for `POST /connections/:id/test`, persisting the
    /// outcome (and, with `accept_host_key`, rotating the pin).
    pub async fn test_connection(
        &self,
        account: &Account,
        connection: &Connection,
        accept_host_key: bool,
        now: DateTime<Utc>,
    ) -> Result<ProbeOutcome> {
        let keypair = self
            .store
            .get_key(account.id, connection.keypair_id)
            .await?
            .ok_or_else(|| AppError::not_found("connection keypair missing"))?;
        if !keypair.active {
            return Err(AppError::conflict(
                "keypair_revoked",
                "the keypair for this connection has been revoked",
            ));
        }

        let kek = self.master_key.derive_kek(account.id);
        let private_key = crypto::open(&kek, &keypair.private_key_ciphertext)?;
        let private_key = String::from_utf8(private_key)
            .map_err(|_| AppError::Crypto("decrypted key is not utf-8".into()))?;

        let expected = if accept_host_key {
            None
        } else {
            connection.pinned_host_key_fingerprint.as_deref()
        };

        let outcome = self
            .prober
            .probe(ProbeTarget {
                host: &connection.host,
                port: connection.port,
                username: &connection.username,
                private_key_openssh: &private_key,
                expected_fingerprint: expected,
                timeout: self.config.request_timeout,
            })
            .await;

        let (result, fingerprint, host_key) = match &outcome {
            ProbeOutcome::Ok {
                host_key_fingerprint,
                host_key,
                ..
            } => (
                TestResult::Ok,
                Some(host_key_fingerprint.as_str()),
                Some(host_key.as_str()),
            ),
            ProbeOutcome::HostKeyChanged { .. } => (TestResult::HostKeyChanged, None, None),
            ProbeOutcome::Failed { .. } => (TestResult::Failed, None, None),
            ProbeOutcome::Timeout { .. } => (TestResult::Timeout, None, None),
        };
        self.store
            .record_connection_test(connection.id, result, fingerprint, host_key, accept_host_key, now)
            .await?;

        Ok(outcome)
    }
}

fn closure_message(reason_tag: &str) -> &'static str {
    match reason_tag {
        reason::USER_REQUEST => "session terminated at your request",
        reason::CREDIT_EXHAUSTED => "credit balance exhausted",
        reason::IDLE_TIMEOUT => "session closed after idle timeout",
        reason::KEY_REVOKED => "the session keypair was revoked",
        reason::STALE_RECONCILED => "session state was reconciled",
        reason::SHUTDOWN => "server is shutting down",
        _ => "session closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_pattern_accepts_plain_unix_names() {
        for ok in ["root", "deploy", "_svc", "a", "user-1", "user_2"] {
            assert!(USERNAME_RE.is_match(ok), "{ok} should be valid");
        }
    }

    #[test]
    fn username_pattern_rejects_garbage() {
        for bad in ["Root!", "", "0user", "user name", "UPPER", &"a".repeat(33)] {
            assert!(!USERNAME_RE.is_match(bad), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn host_pattern_rejects_shell_metacharacters() {
        assert!(HOST_RE.is_match("1.2.3.4"));
        assert!(HOST_RE.is_match("host.example.com"));
        assert!(!HOST_RE.is_match("host;rm -rf /"));
        assert!(!HOST_RE.is_match(""));
        assert!(!HOST_RE.is_match("-leading.dash"));
    }
}
