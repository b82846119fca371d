//! Shared fixtures for the integration tests: an in-memory store, a stub
//! prober, and a launcher whose "control master" is a plain file standing
//! in for the socket.

#![allow(dead_code)] // each test binary uses a subset of these helpers

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use clawdfather::config::Config;
use clawdfather::error::{AppError, Result};
use clawdfather::sessions::{SessionManager, SessionRegistry};
use clawdfather::ssh::{
    ConnectionProber, ControlChannel, ControlLauncher, ControlTarget, ProbeOutcome, ProbeTarget,
};
use clawdfather::state::AppState;
use clawdfather::store::{Account, MemoryStore, NewOAuthIdentity, Store};
use clawdfather::ticker::CreditTicker;

pub const TICK: Duration = Duration::from_secs(30);

pub fn test_config(runtime_dir: PathBuf) -> Config {
    Config {
        log_level: "info".to_string(),
        master_key: "integration-test-master-key".to_string(),
        web_port: 0,
        web_domain: "http://localhost:8080".to_string(),
        database_url: None,
        session_timeout: Duration::from_secs(30 * 60),
        tick_interval: TICK,
        ssh_port: 22,
        session_cap: 3,
        runtime_dir,
        token_ttl: Duration::from_secs(30 * 24 * 3600),
        stripe_secret_key: None,
        stripe_webhook_secret: Some("whsec_test".to_string()),
        github_client_id: "test-client".to_string(),
        github_client_secret: "test-secret".to_string(),
        shutdown_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
    }
}

/// Prober stub returning a configurable outcome and counting invocations.
pub struct StubProber {
    outcome: std::sync::Mutex<ProbeOutcome>,
    pub calls: AtomicUsize,
}

impl StubProber {
    pub fn ok() -> Self {
        Self::with(ProbeOutcome::Ok {
            latency_ms: 12,
            host_key_fingerprint: "SHA256:stubstubstubstubstubstubstubstubstubstubstu".to_string(),
            host_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIStubHostKey".to_string(),
        })
    }

    pub fn with(outcome: ProbeOutcome) -> Self {
        Self {
            outcome: std::sync::Mutex::new(outcome),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, outcome: ProbeOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl ConnectionProber for StubProber {
    async fn probe(&self, _target: ProbeTarget<'_>) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.lock().unwrap().clone()
    }
}

/// "Control channel" whose socket is a plain file, so termination tests
/// can assert the socket disappears.
pub struct FileChannel {
    path: PathBuf,
}

#[async_trait]
impl ControlChannel for FileChannel {
    fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn check(&self) -> bool {
        self.path.exists()
    }

    async fn run(&self, command: &str, _timeout: Duration) -> Result<String> {
        Ok(format!("ran: {command}\n"))
    }

    async fn stop(&self, _grace: Duration) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Launcher stub creating [`FileChannel`]s; flip `fail` to exercise the
/// launch-failure path.
pub struct StubLauncher {
    dir: PathBuf,
    pub fail: AtomicBool,
}

impl StubLauncher {
    pub fn new(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ControlLauncher for StubLauncher {
    async fn launch(&self, target: ControlTarget) -> Result<Arc<dyn ControlChannel>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::SshLaunch("stub launcher set to fail".into()));
        }
        let path = self.dir.join(format!("{}.sock", target.session_id));
        std::fs::write(&path, b"").unwrap();
        Ok(Arc::new(FileChannel { path }))
    }
}

/// Everything a session/ticker test needs, wired onto the memory store.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub registry: Arc<SessionRegistry>,
    pub manager: Arc<SessionManager>,
    pub ticker: CreditTicker,
    pub prober: Arc<StubProber>,
    pub launcher: Arc<StubLauncher>,
    pub config: Arc<Config>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(tmp.path().to_path_buf()));
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let prober = Arc::new(StubProber::ok());
        let launcher = Arc::new(StubLauncher::new(tmp.path().join("sockets")));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            registry.clone(),
            prober.clone(),
            launcher.clone(),
            config.clone(),
        ));
        let ticker = CreditTicker::new(store.clone(), registry.clone(), manager.clone(), TICK);
        Self {
            store,
            registry,
            manager,
            ticker,
            prober,
            launcher,
            config,
            _tmp: tmp,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.store.clone(),
            self.registry.clone(),
            self.manager.clone(),
            self.config.clone(),
        )
    }

    /// Create an account via the OAuth path and grant it `seconds` of
    /// credit.
    pub async fn account_with_credits(&self, seconds: i64) -> Account {
        let (account, _) = self
            .store
            .upsert_oauth_account(new_identity(&Uuid::new_v4().to_string()))
            .await
            .unwrap();
        if seconds > 0 {
            self.store
                .add_credits(account.id, seconds, "bonus:welcome", "test", Utc::now())
                .await
                .unwrap();
        }
        self.store.get_account(account.id).await.unwrap().unwrap()
    }

    /// Bootstrap + confirm against a unique host; returns (session id,
    /// chat token).
    pub async fn start_session(&self, account: &Account, host: &str) -> (Uuid, String) {
        let outcome = self
            .manager
            .bootstrap(account, host, "deploy", None)
            .await
            .unwrap();
        let confirm = self
            .manager
            .confirm(account, outcome.connection_id, None, None, Utc::now())
            .await
            .unwrap();
        (confirm.lease.id, confirm.chat_token)
    }
}

pub fn new_identity(provider_user_id: &str) -> NewOAuthIdentity {
    NewOAuthIdentity {
        candidate_account_id: Uuid::new_v4(),
        provider: "github".to_string(),
        provider_user_id: provider_user_id.to_string(),
        provider_username: format!("user-{provider_user_id}"),
        provider_email: None,
        access_token_ciphertext: String::new(),
        scopes: "read:user".to_string(),
    }
}

/// Assert the denormalized balance equals the ledger sum for an account.
pub async fn assert_ledger_consistent(store: &Arc<dyn Store>, account_id: Uuid) {
    let account = store.get_account(account_id).await.unwrap().unwrap();
    let sum: i64 = store
        .list_ledger(account_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.delta_seconds)
        .sum();
    assert_eq!(
        account.balance_seconds, sum,
        "balance must equal ledger sum"
    );
}
