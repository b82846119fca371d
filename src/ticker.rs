//! The credit ticker: one periodic task that keeps the ledger honest.
//!
//! Each tick first reconciles stale `account_sessions` rows (persistent
//! records whose runtime session no longer exists), then debits one tick
//! period of wall-clock seconds from every live session's account. A
//! debit is all-or-nothing: when the balance cannot cover a full period
//! the session terminates with `credit_exhausted` and no partial entry is
//! appended, so the worst-case operator loss is under one tick. Ticks are
//! serialized by construction; the service loop awaits each tick before
//! sleeping again, so a missed tick debits one period, never two.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::sessions::{SessionManager, SessionRegistry, reason};
use crate::store::{DebitOutcome, LeaseStatus, Store};

/// Counters from one tick, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Stale account_sessions rows closed.
    pub reconciled: u64,
    /// Sessions successfully debited one period.
    pub debited: u64,
    /// Sessions terminated for credit exhaustion.
    pub exhausted: u64,
}

pub struct CreditTicker {
    store: Arc<dyn Store>,
    registry: Arc<SessionRegistry>,
    manager: Arc<SessionManager>,
    period: Duration,
}

impl CreditTicker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SessionRegistry>,
        manager: Arc<SessionManager>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            manager,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One full tick: reconcile, then debit.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary {
            reconciled: self.clean_stale_sessions(now).await?,
            ..TickSummary::default()
        };

        let seconds = self.period.as_secs() as i64;
        for live in self.registry.list() {
            // The store is authoritative for ownership; a session whose row
            // vanished is torn down instead of debited.
            let Some(account_id) = self.store.get_account_id_for_session(live.session_id).await?
            else {
                warn!(session_id = %live.session_id, "live session without account row, terminating");
                self.manager
                    .terminate(live.session_id, reason::STALE_RECONCILED, now)
                    .await?;
                continue;
            };

            match self
                .store
                .debit_credits(account_id, seconds, live.session_id, now)
                .await?
            {
                DebitOutcome::Applied(balance) => {
                    self.store.record_session_debit(live.session_id, now).await?;
                    summary.debited += 1;
                    if balance < seconds {
                        info!(session_id = %live.session_id, balance, "balance below one tick period");
                    }
                }
                DebitOutcome::InsufficientFunds => {
                    self.manager
                        .terminate(live.session_id, reason::CREDIT_EXHAUSTED, now)
                        .await?;
                    summary.exhausted += 1;
                }
            }
        }

        if summary != TickSummary::default() {
            info!(
                reconciled = summary.reconciled,
                debited = summary.debited,
                exhausted = summary.exhausted,
                "tick complete"
            );
        }
        Ok(summary)
    }

    /// Close every account_sessions row whose session id has no registry
    /// entry, revoking its tokens and ending its lease. Returns the count
    /// of rows actually transitioned.
    pub async fn clean_stale_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut cleaned = 0;
        for row in self.store.list_open_account_sessions().await? {
            if self.registry.get(row.session_id).is_some() {
                continue;
            }
            if !self.store.end_account_session(row.session_id, now).await? {
                continue;
            }
            self.store
                .revoke_tokens_by_session(row.session_id, now)
                .await?;
            if let Some(lease) = self.store.get_lease(row.session_id).await?
                && !matches!(lease.status, LeaseStatus::Ended | LeaseStatus::Failed)
            {
                self.store
                    .update_lease_status(
                        row.session_id,
                        LeaseStatus::Ended,
                        Some(reason::STALE_RECONCILED),
                        now,
                    )
                    .await?;
            }
            cleaned += 1;
        }
        Ok(cleaned)
    }
}
