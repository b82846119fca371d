//! Shared application state handed to every request handler.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::config::Config;
use crate::crypto::MasterKey;
use crate::sessions::{SessionManager, SessionRegistry};
use crate::store::Store;
use crate::web::rate_limit::IpRateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<SessionRegistry>,
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
    pub master_key: MasterKey,
    /// Guards the OAuth start endpoint, keyed by client IP.
    pub oauth_limiter: Arc<IpRateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        manager: Arc<SessionManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            manager,
            master_key: MasterKey::new(config.master_key.clone()),
            config,
            oauth_limiter: Arc::new(IpRateLimiter::oauth_start()),
            started_at: Instant::now(),
        }
    }

    /// Fire-and-forget audit write; logging must never block a caller.
    pub fn audit(&self, account_id: uuid::Uuid, action: &'static str, detail: serde_json::Value) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_audit(account_id, action, detail, Utc::now()).await {
                warn!(error = %e, action, "audit write failed");
            }
        });
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
