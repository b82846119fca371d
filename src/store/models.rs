//! Persistent entities shared by both store backends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// The primary tenant entity. Owns keys, connections, sessions and the
/// credit ledger; everything else cascades from it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
    /// Denormalized sum of the account's ledger deltas. Maintained
    /// transactionally; recomputed from the ledger on Postgres boot.
    pub balance_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

/// A linked identity-provider account. At most one row per
/// (provider, provider_user_id).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OAuthIdentity {
    pub provider: String,
    pub provider_user_id: String,
    pub provider_username: String,
    pub provider_email: Option<String>,
    /// Provider access token sealed under the owning account's KEK.
    #[serde(skip)]
    pub access_token_ciphertext: String,
    pub scopes: String,
}

/// A bearer-token record. Only the hash of the external form is stored; a
/// token is valid iff present, unrevoked, and unexpired.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub token_hash: String,
    pub account_id: Uuid,
    /// When set, the token only authorizes the chat channel of this
    /// session.
    pub bound_session_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// A server-held SSH keypair. The private key never leaves the server
/// unencrypted; `active = false` means revoked.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Keypair {
    pub id: Uuid,
    pub account_id: Uuid,
    pub label: String,
    pub algorithm: String,
    pub public_key_openssh: String,
    pub fingerprint: String,
    #[serde(skip)]
    pub private_key_ciphertext: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Outcome of the most recent connectivity test against a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Ok,
    Failed,
    Timeout,
    HostKeyChanged,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::HostKeyChanged => "host_key_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "host_key_changed" => Some(Self::HostKeyChanged),
            _ => None,
        }
    }
}

/// A saved (host, port, user, keypair) tuple; the reusable definition of a
/// remote target. Unique per (account, host, port, username).
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: Uuid,
    pub account_id: Uuid,
    pub keypair_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub label: String,
    /// Once pinned, the host key only rotates via explicit user acceptance.
    pub pinned_host_key_fingerprint: Option<String>,
    /// Full OpenSSH host-key line backing the fingerprint, kept so the
    /// control master can run with strict host-key checking.
    #[serde(skip)]
    pub pinned_host_key: Option<String>,
    pub last_test_result: Option<TestResult>,
    pub last_test_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle states of a session lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Pending,
    Active,
    Ended,
    Failed,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending and active leases count against the per-account cap.
    pub fn counts_against_cap(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// The persistent record of a session's intent-to-run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLease {
    pub id: Uuid,
    pub account_id: Uuid,
    pub connection_id: Uuid,
    pub status: LeaseStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `user_request`, `credit_exhausted`, `idle_timeout`, `key_revoked`,
    /// `stale_reconciled`, `launch_failed`, `shutdown`.
    pub termination_reason: Option<String>,
}

/// One signed movement of credit-seconds on an account.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: Uuid,
    pub delta_seconds: i64,
    pub reason: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Row in the active-session table the credit ticker sweeps.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountSession {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_debit_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Audit-log row backing `GET /api/v1/audit`. Writes are best-effort.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub account_id: Uuid,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an account together with its first keypair
/// (`resolve_or_create_account`). The caller pre-generates the account id
/// so the private key can be sealed under the derived KEK before the row
/// exists.
#[derive(Debug, Clone)]
pub struct NewAccountWithKey {
    pub account_id: Uuid,
    pub display_name: String,
    pub fingerprint: String,
    pub public_key_openssh: String,
    pub private_key_ciphertext: String,
    pub key_label: String,
}

/// Outcome of `resolve_or_create_account`.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub account: Account,
    pub keypair: Keypair,
    pub is_new: bool,
}

/// Input for linking/updating an OAuth identity, creating the account on
/// first sight.
#[derive(Debug, Clone)]
pub struct NewOAuthIdentity {
    /// Pre-generated id used only if the identity is unseen.
    pub candidate_account_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub provider_username: String,
    pub provider_email: Option<String>,
    pub access_token_ciphertext: String,
    pub scopes: String,
}

#[derive(Debug, Clone)]
pub struct NewKeypair {
    pub id: Uuid,
    pub account_id: Uuid,
    pub label: String,
    pub public_key_openssh: String,
    pub fingerprint: String,
    pub private_key_ciphertext: String,
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub id: Uuid,
    pub account_id: Uuid,
    pub keypair_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub label: String,
}

/// Fields a `PATCH /connections/:id` may change.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub label: Option<String>,
    pub keypair_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub account_id: Uuid,
    pub bound_session_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub ttl: std::time::Duration,
}

/// The one moment the plaintext token exists outside the caller's hands.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub plaintext: String,
    pub record: TokenRecord,
}

/// Result of an attempted debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The full amount was debited; carries the new balance.
    Applied(i64),
    /// Balance was below the requested amount; nothing changed.
    InsufficientFunds,
}
