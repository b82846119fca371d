//! Durable entity operations behind a single repository interface.
//!
//! Two backends implement [`Store`]: [`PgStore`] over a Postgres pool
//! (row-level locking, real transactions) and [`MemoryStore`] (one async
//! mutex over plain tables, giving the same linearizability guarantees).
//! Tests and DATABASE_URL-less boots run on the memory backend; the
//! transactional contracts are identical.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

/// Maximum page size for audit listing.
pub const AUDIT_PAGE_LIMIT: usize = 100;

#[async_trait]
pub trait Store: Send + Sync {
    // ---- accounts -------------------------------------------------------

    /// Return the owner of the keypair with this fingerprint, or atomically
    /// create an account plus a keypair bearing it. Concurrent callers with
    /// the same fingerprint converge on a single account.
    async fn resolve_or_create_account(&self, new: NewAccountWithKey) -> Result<ResolvedAccount>;

    /// Link or refresh an OAuth identity, creating the owning account on
    /// first sight. Returns the account and whether it was created.
    async fn upsert_oauth_account(&self, new: NewOAuthIdentity) -> Result<(Account, bool)>;

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>>;

    async fn touch_account(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn list_oauth_identities(&self, account_id: Uuid) -> Result<Vec<OAuthIdentity>>;

    /// Replace the sealed provider access token for an identity. Separate
    /// from the upsert because the KEK is derived from the account id the
    /// upsert resolves.
    async fn update_oauth_token(
        &self,
        provider: &str,
        provider_user_id: &str,
        access_token_ciphertext: &str,
    ) -> Result<()>;

    // ---- keypairs -------------------------------------------------------

    /// Fingerprint must be unique within the account.
    async fn add_key(&self, new: NewKeypair) -> Result<Keypair>;

    /// Fails with `last_key` when removal would leave the account with no
    /// active keypair, and `not_found` when absent or foreign-owned.
    async fn remove_key(&self, account_id: Uuid, key_id: Uuid) -> Result<()>;

    async fn list_keys(&self, account_id: Uuid) -> Result<Vec<Keypair>>;

    async fn get_key(&self, account_id: Uuid, key_id: Uuid) -> Result<Option<Keypair>>;

    /// Oldest active keypair of the account, if any.
    async fn get_active_keypair(&self, account_id: Uuid) -> Result<Option<Keypair>>;

    // ---- bearer tokens --------------------------------------------------

    /// Create a token record storing only the hash. The plaintext is
    /// returned exactly once and never persisted.
    async fn issue_token(&self, new: NewToken, now: DateTime<Utc>) -> Result<IssuedToken>;

    /// Hash the plaintext, look up, and return only if unrevoked and
    /// unexpired at `now`.
    async fn get_account_by_token(
        &self,
        token_plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Account, TokenRecord)>>;

    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Revoke every token bound to this session id. Returns the count.
    async fn revoke_tokens_by_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Delete rows whose expiry passed or whose revocation is set. Returns
    /// the number removed.
    async fn clean_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64>;

    // ---- credit ledger --------------------------------------------------

    /// Append a positive ledger entry and bump the balance atomically.
    /// Returns the new balance.
    async fn add_credits(
        &self,
        account_id: Uuid,
        seconds: i64,
        reason: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// All-or-nothing debit: inside one transaction, check balance ≥
    /// `seconds`, append a negative entry tagged `session_debit:<id>` and
    /// decrement. On insufficient funds nothing changes.
    async fn debit_credits(
        &self,
        account_id: Uuid,
        seconds: i64,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome>;

    async fn list_ledger(&self, account_id: Uuid) -> Result<Vec<LedgerEntry>>;

    // ---- stripe idempotency --------------------------------------------

    /// Insert the event id. Returns false (cleanly) when already present so
    /// the caller treats the event as handled.
    async fn record_stripe_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn has_processed_stripe_event(&self, event_id: &str) -> Result<bool>;

    // ---- account sessions (swept by the ticker) ------------------------

    async fn start_account_session(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Close the row. Returns true if a live row was actually closed.
    async fn end_account_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn get_account_id_for_session(&self, session_id: Uuid) -> Result<Option<Uuid>>;

    /// All open rows, for the ticker's reconciliation pass.
    async fn list_open_account_sessions(&self) -> Result<Vec<AccountSession>>;

    async fn record_session_debit(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    // ---- connections ----------------------------------------------------

    /// Unique (account, host, port, username); duplicate creation conflicts.
    async fn create_connection(&self, new: NewConnection) -> Result<Connection>;

    async fn get_connection(&self, account_id: Uuid, id: Uuid) -> Result<Option<Connection>>;

    async fn find_connection(
        &self,
        account_id: Uuid,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<Option<Connection>>;

    async fn list_connections(&self, account_id: Uuid) -> Result<Vec<Connection>>;

    async fn update_connection(
        &self,
        account_id: Uuid,
        id: Uuid,
        patch: ConnectionPatch,
    ) -> Result<Connection>;

    async fn delete_connection(&self, account_id: Uuid, id: Uuid) -> Result<()>;

    /// Persist a probe outcome. The host key only pins when none is pinned
    /// yet or `accept_host_key` is set.
    #[allow(clippy::too_many_arguments)]
    async fn record_connection_test(
        &self,
        id: Uuid,
        result: TestResult,
        host_key_fingerprint: Option<&str>,
        host_key: Option<&str>,
        accept_host_key: bool,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // ---- session leases -------------------------------------------------

    /// One transaction backing a confirmed session start: insert a pending
    /// lease (enforcing the per-account cap), open the `account_sessions`
    /// row, and issue a bearer token bound to the session id.
    async fn begin_session(
        &self,
        lease_id: Uuid,
        account_id: Uuid,
        connection_id: Uuid,
        cap: usize,
        token: NewToken,
        now: DateTime<Utc>,
    ) -> Result<(SessionLease, IssuedToken)>;

    async fn count_active_leases(&self, account_id: Uuid) -> Result<usize>;

    async fn update_lease_status(
        &self,
        lease_id: Uuid,
        status: LeaseStatus,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<SessionLease>>;

    async fn list_leases(&self, account_id: Uuid) -> Result<Vec<SessionLease>>;

    // ---- oauth state cache ---------------------------------------------

    async fn put_oauth_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically delete the row (single use) and return its verifier;
    /// `None` when absent or expired at `now`.
    async fn consume_oauth_state(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>>;

    async fn clean_oauth_states(&self, now: DateTime<Utc>) -> Result<u64>;

    // ---- audit ----------------------------------------------------------

    async fn append_audit(
        &self,
        account_id: Uuid,
        action: &str,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Newest-first page keyed by `created_at < before`, optionally
    /// filtered by action. Callers clamp `limit` ([`AUDIT_PAGE_LIMIT`] at
    /// the HTTP surface).
    async fn list_audit(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>>;

    // ---- liveness -------------------------------------------------------

    async fn ping(&self) -> Result<()>;
}
