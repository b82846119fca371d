//! Periodic service hosting the credit ticker, the idle sweep, and the
//! slow housekeeping passes (expired tokens, stale OAuth states).
//!
//! One loop awaits each pass before sleeping again, so ticks never
//! overlap and a delayed tick debits a single period.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::services::Service;
use crate::sessions::SessionManager;
use crate::store::Store;
use crate::ticker::CreditTicker;

/// Token/state cleanup cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

pub struct TickerService {
    ticker: Arc<CreditTicker>,
    manager: Arc<SessionManager>,
    store: Arc<dyn Store>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl TickerService {
    pub fn new(
        ticker: Arc<CreditTicker>,
        manager: Arc<SessionManager>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            ticker,
            manager,
            store,
            shutdown_tx: None,
        }
    }

    async fn housekeeping(store: &Arc<dyn Store>) {
        let now = Utc::now();
        match store.clean_expired_tokens(now).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "cleaned expired tokens"),
            Err(e) => warn!(error = %e, "token cleanup failed"),
        }
        if let Err(e) = store.clean_oauth_states(now).await {
            warn!(error = %e, "oauth state cleanup failed");
        }
    }
}

#[async_trait::async_trait]
impl Service for TickerService {
    fn name(&self) -> &'static str {
        "ticker"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let mut interval = tokio::time::interval(self.ticker.period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first fire would double-charge fresh sessions.
        interval.tick().await;

        let mut last_housekeeping = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.ticker.tick(now).await {
                        warn!(error = %e, "tick failed");
                    }
                    if let Err(e) = self.manager.idle_sweep(now).await {
                        warn!(error = %e, "idle sweep failed");
                    }
                    if last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
                        last_housekeeping = Instant::now();
                        Self::housekeeping(&self.store).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(service = "ticker", "stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        // Live control masters must not outlive the process.
        self.manager.shutdown_all(Utc::now()).await;
        Ok(())
    }
}
