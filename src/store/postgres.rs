//! Postgres store backend.
//!
//! Every multi-statement mutation runs inside a transaction; per-account
//! ledger linearizability comes from `SELECT … FOR UPDATE` on the account
//! row. The schema is applied idempotently at connect time, after which
//! denormalized balances are recomputed from the ledger.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::crypto;
use crate::error::{AppError, Result};
use crate::store::Store;
use crate::store::models::*;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

pub struct PgStore {
    pool: PgPool,
}

/// Private row types for entities whose models carry enums or narrow ints.
#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: Uuid,
    account_id: Uuid,
    keypair_id: Uuid,
    host: String,
    port: i32,
    username: String,
    label: String,
    pinned_host_key_fingerprint: Option<String>,
    pinned_host_key: Option<String>,
    last_test_result: Option<String>,
    last_test_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ConnectionRow> for Connection {
    fn from(row: ConnectionRow) -> Self {
        Connection {
            id: row.id,
            account_id: row.account_id,
            keypair_id: row.keypair_id,
            host: row.host,
            port: row.port as u16,
            username: row.username,
            label: row.label,
            pinned_host_key_fingerprint: row.pinned_host_key_fingerprint,
            pinned_host_key: row.pinned_host_key,
            last_test_result: row.last_test_result.as_deref().and_then(TestResult::parse),
            last_test_at: row.last_test_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    id: Uuid,
    account_id: Uuid,
    connection_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    termination_reason: Option<String>,
}

impl From<LeaseRow> for SessionLease {
    fn from(row: LeaseRow) -> Self {
        SessionLease {
            id: row.id,
            account_id: row.account_id,
            connection_id: row.connection_id,
            status: LeaseStatus::parse(&row.status).unwrap_or(LeaseStatus::Failed),
            started_at: row.started_at,
            ended_at: row.ended_at,
            termination_reason: row.termination_reason,
        }
    }
}

impl PgStore {
    /// Connect, apply the schema, and recompute denormalized balances from
    /// the append-only ledger.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to create database pool")?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply schema")?;

        sqlx::query(
            r#"
            UPDATE accounts a
            SET balance_seconds = COALESCE(
                (SELECT SUM(l.delta_seconds) FROM ledger_entries l WHERE l.account_id = a.id),
                0
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to recover balances from ledger")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the account row, returning its balance. Errors with NotFound
    /// for unknown accounts.
    async fn lock_account(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT balance_seconds FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await
                .context("failed to lock account row")?;
        row.map(|(balance,)| balance)
            .ok_or_else(|| AppError::not_found("account not found"))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn resolve_or_create_account(&self, new: NewAccountWithKey) -> Result<ResolvedAccount> {
        // Two attempts: the second only runs when a concurrent creator wins
        // the unique-fingerprint race, in which case the keypair must exist.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await.context("begin")?;

            let existing: Option<Keypair> =
                sqlx::query_as("SELECT * FROM keypairs WHERE fingerprint = $1")
                    .bind(&new.fingerprint)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("failed to look up keypair by fingerprint")?;

            if let Some(keypair) = existing {
                let account: Account = sqlx::query_as("SELECT * FROM accounts WHERE id = $1")
                    .bind(keypair.account_id)
                    .fetch_one(&mut *tx)
                    .await
                    .context("failed to load keypair owner")?;
                tx.commit().await.context("commit")?;
                return Ok(ResolvedAccount {
                    account,
                    keypair,
                    is_new: false,
                });
            }

            let account: Account = sqlx::query_as(
                "INSERT INTO accounts (id, display_name) VALUES ($1, $2) RETURNING *",
            )
            .bind(new.account_id)
            .bind(&new.display_name)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert account")?;

            let inserted: Option<Keypair> = sqlx::query_as(
                r#"
                INSERT INTO keypairs
                    (id, account_id, label, public_key_openssh, fingerprint, private_key_ciphertext)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (fingerprint) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account.id)
            .bind(&new.key_label)
            .bind(&new.public_key_openssh)
            .bind(&new.fingerprint)
            .bind(&new.private_key_ciphertext)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to insert keypair")?;

            match inserted {
                Some(keypair) => {
                    tx.commit().await.context("commit")?;
                    return Ok(ResolvedAccount {
                        account,
                        keypair,
                        is_new: true,
                    });
                }
                None => {
                    // Lost the race; drop our tentative account and retry
                    // the lookup path.
                    tx.rollback().await.context("rollback")?;
                }
            }
        }
        Err(AppError::Internal(anyhow::anyhow!(
            "fingerprint resolution did not converge"
        )))
    }

    async fn upsert_oauth_account(&self, new: NewOAuthIdentity) -> Result<(Account, bool)> {
        let mut tx = self.pool.begin().await.context("begin")?;

        let owner: Option<(Uuid,)> = sqlx::query_as(
            "SELECT account_id FROM oauth_identities WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(&new.provider)
        .bind(&new.provider_user_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to look up oauth identity")?;

        if let Some((account_id,)) = owner {
            sqlx::query(
                r#"
                UPDATE oauth_identities
                SET provider_username = $3, provider_email = $4,
                    access_token_ciphertext = $5, scopes = $6
                WHERE provider = $1 AND provider_user_id = $2
                "#,
            )
            .bind(&new.provider)
            .bind(&new.provider_user_id)
            .bind(&new.provider_username)
            .bind(&new.provider_email)
            .bind(&new.access_token_ciphertext)
            .bind(&new.scopes)
            .execute(&mut *tx)
            .await
            .context("failed to refresh oauth identity")?;

            let account: Account = sqlx::query_as(
                "UPDATE accounts SET last_seen_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(account_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to touch identity owner")?;
            tx.commit().await.context("commit")?;
            return Ok((account, false));
        }

        let account: Account = sqlx::query_as(
            "INSERT INTO accounts (id, display_name, email) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(new.candidate_account_id)
        .bind(&new.provider_username)
        .bind(&new.provider_email)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert account")?;

        sqlx::query(
            r#"
            INSERT INTO oauth_identities
                (account_id, provider, provider_user_id, provider_username,
                 provider_email, access_token_ciphertext, scopes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id)
        .bind(&new.provider)
        .bind(&new.provider_user_id)
        .bind(&new.provider_username)
        .bind(&new.provider_email)
        .bind(&new.access_token_ciphertext)
        .bind(&new.scopes)
        .execute(&mut *tx)
        .await
        .context("failed to insert oauth identity")?;

        tx.commit().await.context("commit")?;
        Ok((account, true))
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        sqlx::query_as("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get account")
            .map_err(Into::into)
    }

    async fn touch_account(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_seen_at = $2 WHERE id = $1")
            .bind(account_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to touch account")?;
        Ok(())
    }

    async fn list_oauth_identities(&self, account_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        sqlx::query_as(
            r#"
            SELECT provider, provider_user_id, provider_username, provider_email,
                   access_token_ciphertext, scopes
            FROM oauth_identities WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list oauth identities")
        .map_err(Into::into)
    }

    async fn update_oauth_token(
        &self,
        provider: &str,
        provider_user_id: &str,
        access_token_ciphertext: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE oauth_identities SET access_token_ciphertext = $3
            WHERE provider = $1 AND provider_user_id = $2
            "#,
        )
        .bind(provider)
        .bind(provider_user_id)
        .bind(access_token_ciphertext)
        .execute(&self.pool)
        .await
        .context("failed to update oauth token")?;
        Ok(())
    }

    async fn add_key(&self, new: NewKeypair) -> Result<Keypair> {
        let inserted: Option<Keypair> = sqlx::query_as(
            r#"
            INSERT INTO keypairs
                (id, account_id, label, public_key_openssh, fingerprint, private_key_ciphertext)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.account_id)
        .bind(&new.label)
        .bind(&new.public_key_openssh)
        .bind(&new.fingerprint)
        .bind(&new.private_key_ciphertext)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert keypair")?;

        inserted.ok_or_else(|| {
            AppError::conflict(
                "duplicate_fingerprint",
                "a key with this fingerprint already exists",
            )
        })
    }

    async fn remove_key(&self, account_id: Uuid, key_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin")?;
        Self::lock_account(&mut tx, account_id).await?;

        let target: Option<(bool,)> =
            sqlx::query_as("SELECT active FROM keypairs WHERE id = $1 AND account_id = $2")
                .bind(key_id)
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to look up keypair")?;
        match target {
            None | Some((false,)) => return Err(AppError::not_found("key not found")),
            Some((true,)) => {}
        }

        let (active_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM keypairs WHERE account_id = $1 AND active",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to count active keypairs")?;
        if active_count <= 1 {
            return Err(AppError::conflict(
                "last_key",
                "an account must retain at least one active key",
            ));
        }

        sqlx::query("UPDATE keypairs SET active = FALSE WHERE id = $1")
            .bind(key_id)
            .execute(&mut *tx)
            .await
            .context("failed to revoke keypair")?;
        tx.commit().await.context("commit")?;
        Ok(())
    }

    async fn list_keys(&self, account_id: Uuid) -> Result<Vec<Keypair>> {
        sqlx::query_as("SELECT * FROM keypairs WHERE account_id = $1 ORDER BY created_at")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list keypairs")
            .map_err(Into::into)
    }

    async fn get_key(&self, account_id: Uuid, key_id: Uuid) -> Result<Option<Keypair>> {
        sqlx::query_as("SELECT * FROM keypairs WHERE id = $1 AND account_id = $2")
            .bind(key_id)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get keypair")
            .map_err(Into::into)
    }

    async fn get_active_keypair(&self, account_id: Uuid) -> Result<Option<Keypair>> {
        sqlx::query_as(
            "SELECT * FROM keypairs WHERE account_id = $1 AND active ORDER BY created_at LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get active keypair")
        .map_err(Into::into)
    }

    async fn issue_token(&self, new: NewToken, now: DateTime<Utc>) -> Result<IssuedToken> {
        let plaintext = crypto::generate_token();
        let expires_at = now
            + chrono::Duration::from_std(new.ttl)
                .map_err(|e| AppError::validation(format!("invalid ttl: {e}")))?;

        let record: TokenRecord = sqlx::query_as(
            r#"
            INSERT INTO app_sessions
                (id, token_hash, account_id, bound_session_id, client_ip, user_agent,
                 created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(crypto::hash_token(&plaintext))
        .bind(new.account_id)
        .bind(new.bound_session_id)
        .bind(&new.client_ip)
        .bind(&new.user_agent)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert token record")?;

        Ok(IssuedToken { plaintext, record })
    }

    async fn get_account_by_token(
        &self,
        token_plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Account, TokenRecord)>> {
        let record: Option<TokenRecord> = sqlx::query_as(
            r#"
            SELECT * FROM app_sessions
            WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > $2
            "#,
        )
        .bind(crypto::hash_token(token_plaintext))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up token")?;

        let Some(record) = record else {
            return Ok(None);
        };
        let account: Option<Account> = sqlx::query_as("SELECT * FROM accounts WHERE id = $1")
            .bind(record.account_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load token owner")?;
        Ok(account.map(|a| (a, record)))
    }

    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE app_sessions SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL")
            .bind(token_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to revoke token")?;
        Ok(())
    }

    async fn revoke_tokens_by_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE app_sessions SET revoked_at = $2
            WHERE bound_session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to revoke session tokens")?;
        Ok(result.rows_affected())
    }

    async fn clean_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM app_sessions WHERE expires_at <= $1 OR revoked_at IS NOT NULL")
                .bind(now)
                .execute(&self.pool)
                .await
                .context("failed to clean expired tokens")?;
        Ok(result.rows_affected())
    }

    async fn add_credits(
        &self,
        account_id: Uuid,
        seconds: i64,
        reason: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        if seconds <= 0 {
            return Err(AppError::validation("credit grant must be positive"));
        }
        let mut tx = self.pool.begin().await.context("begin")?;
        let balance = Self::lock_account(&mut tx, account_id).await?;
        let new_balance = balance + seconds;

        sqlx::query("UPDATE accounts SET balance_seconds = $2 WHERE id = $1")
            .bind(account_id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await
            .context("failed to bump balance")?;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (account_id, delta_seconds, reason, reference, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account_id)
        .bind(seconds)
        .bind(reason)
        .bind(reference)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to append ledger entry")?;

        tx.commit().await.context("commit")?;
        Ok(new_balance)
    }

    async fn debit_credits(
        &self,
        account_id: Uuid,
        seconds: i64,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome> {
        if seconds <= 0 {
            return Err(AppError::validation("debit must be positive"));
        }
        let mut tx = self.pool.begin().await.context("begin")?;
        let balance = Self::lock_account(&mut tx, account_id).await?;
        if balance < seconds {
            tx.rollback().await.context("rollback")?;
            return Ok(DebitOutcome::InsufficientFunds);
        }
        let new_balance = balance - seconds;

        sqlx::query("UPDATE accounts SET balance_seconds = $2 WHERE id = $1")
            .bind(account_id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await
            .context("failed to decrement balance")?;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (account_id, delta_seconds, reason, reference, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account_id)
        .bind(-seconds)
        .bind(format!("session_debit:{session_id}"))
        .bind(session_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to append debit entry")?;

        tx.commit().await.context("commit")?;
        Ok(DebitOutcome::Applied(new_balance))
    }

    async fn list_ledger(&self, account_id: Uuid) -> Result<Vec<LedgerEntry>> {
        sqlx::query_as("SELECT * FROM ledger_entries WHERE account_id = $1 ORDER BY id")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list ledger")
            .map_err(Into::into)
    }

    async fn record_stripe_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_events_seen (event_id, event_type, first_seen_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to record stripe event")?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_processed_stripe_event(&self, event_id: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM stripe_events_seen WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to check stripe event")?;
        Ok(row.is_some())
    }

    async fn start_account_session(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_sessions (session_id, account_id, started_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(session_id)
        .bind(account_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to start account session")?;
        Ok(())
    }

    async fn end_account_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE account_sessions SET ended_at = $2 WHERE session_id = $1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to end account session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_account_id_for_session(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT account_id FROM account_sessions WHERE session_id = $1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve session account")?;
        Ok(row.map(|(id,)| id))
    }

    async fn list_open_account_sessions(&self) -> Result<Vec<AccountSession>> {
        sqlx::query_as("SELECT * FROM account_sessions WHERE ended_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .context("failed to list open account sessions")
            .map_err(Into::into)
    }

    async fn record_session_debit(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE account_sessions SET last_debit_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to record session debit")?;
        Ok(())
    }

    async fn create_connection(&self, new: NewConnection) -> Result<Connection> {
        let inserted: Option<ConnectionRow> = sqlx::query_as(
            r#"
            INSERT INTO connections (id, account_id, keypair_id, host, port, username, label)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_id, host, port, username) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.account_id)
        .bind(new.keypair_id)
        .bind(&new.host)
        .bind(new.port as i32)
        .bind(&new.username)
        .bind(&new.label)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert connection")?;

        inserted.map(Into::into).ok_or_else(|| {
            AppError::conflict(
                "duplicate_connection",
                "a connection for this target already exists",
            )
        })
    }

    async fn get_connection(&self, account_id: Uuid, id: Uuid) -> Result<Option<Connection>> {
        let row: Option<ConnectionRow> =
            sqlx::query_as("SELECT * FROM connections WHERE id = $1 AND account_id = $2")
                .bind(id)
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to get connection")?;
        Ok(row.map(Into::into))
    }

    async fn find_connection(
        &self,
        account_id: Uuid,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<Option<Connection>> {
        let row: Option<ConnectionRow> = sqlx::query_as(
            r#"
            SELECT * FROM connections
            WHERE account_id = $1 AND host = $2 AND port = $3 AND username = $4
            "#,
        )
        .bind(account_id)
        .bind(host)
        .bind(port as i32)
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("failed to find connection")?;
        Ok(row.map(Into::into))
    }

    async fn list_connections(&self, account_id: Uuid) -> Result<Vec<Connection>> {
        let rows: Vec<ConnectionRow> =
            sqlx::query_as("SELECT * FROM connections WHERE account_id = $1 ORDER BY created_at")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await
                .context("failed to list connections")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_connection(
        &self,
        account_id: Uuid,
        id: Uuid,
        patch: ConnectionPatch,
    ) -> Result<Connection> {
        let row: Option<ConnectionRow> = sqlx::query_as(
            r#"
            UPDATE connections
            SET label = COALESCE($3, label), keypair_id = COALESCE($4, keypair_id)
            WHERE id = $1 AND account_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(account_id)
        .bind(&patch.label)
        .bind(patch.keypair_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update connection")?;
        row.map(Into::into)
            .ok_or_else(|| AppError::not_found("connection not found"))
    }

    async fn delete_connection(&self, account_id: Uuid, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM connections WHERE id = $1 AND account_id = $2")
            .bind(id)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .context("failed to delete connection")?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("connection not found"));
        }
        Ok(())
    }

    async fn record_connection_test(
        &self,
        id: Uuid,
        result: TestResult,
        host_key_fingerprint: Option<&str>,
        host_key: Option<&str>,
        accept_host_key: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connections
            SET last_test_result = $2,
                last_test_at = $3,
                pinned_host_key_fingerprint = CASE
                    WHEN $6 IS NOT NULL AND (pinned_host_key_fingerprint IS NULL OR $4)
                    THEN $6 ELSE pinned_host_key_fingerprint END,
                pinned_host_key = CASE
                    WHEN $6 IS NOT NULL AND (pinned_host_key_fingerprint IS NULL OR $4)
                    THEN $5 ELSE pinned_host_key END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result.as_str())
        .bind(now)
        .bind(accept_host_key)
        .bind(host_key)
        .bind(host_key_fingerprint)
        .execute(&self.pool)
        .await
        .context("failed to record connection test")?;
        Ok(())
    }

    async fn begin_session(
        &self,
        lease_id: Uuid,
        account_id: Uuid,
        connection_id: Uuid,
        cap: usize,
        token: NewToken,
        now: DateTime<Utc>,
    ) -> Result<(SessionLease, IssuedToken)> {
        let expires_at = now
            + chrono::Duration::from_std(token.ttl)
                .map_err(|e| AppError::validation(format!("invalid ttl: {e}")))?;

        let mut tx = self.pool.begin().await.context("begin")?;
        Self::lock_account(&mut tx, account_id).await?;

        let (live,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM session_leases
            WHERE account_id = $1 AND status IN ('pending', 'active')
            "#,
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to count live leases")?;
        if live as usize >= cap {
            return Err(AppError::conflict(
                "session_limit_reached",
                format!("at most {cap} concurrent sessions per account"),
            ));
        }

        let row: LeaseRow = sqlx::query_as(
            r#"
            INSERT INTO session_leases (id, account_id, connection_id, status, started_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING *
            "#,
        )
        .bind(lease_id)
        .bind(account_id)
        .bind(connection_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert lease")?;

        sqlx::query(
            r#"
            INSERT INTO account_sessions (session_id, account_id, started_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(lease_id)
        .bind(account_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to open account session")?;

        let plaintext = crypto::generate_token();
        let record: TokenRecord = sqlx::query_as(
            r#"
            INSERT INTO app_sessions
                (id, token_hash, account_id, bound_session_id, client_ip, user_agent,
                 created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(crypto::hash_token(&plaintext))
        .bind(account_id)
        .bind(lease_id)
        .bind(&token.client_ip)
        .bind(&token.user_agent)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await
        .context("failed to issue session token")?;

        tx.commit().await.context("commit")?;
        Ok((row.into(), IssuedToken { plaintext, record }))
    }

    async fn count_active_leases(&self, account_id: Uuid) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM session_leases
            WHERE account_id = $1 AND status IN ('pending', 'active')
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count leases")?;
        Ok(count as usize)
    }

    async fn update_lease_status(
        &self,
        lease_id: Uuid,
        status: LeaseStatus,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let terminal = matches!(status, LeaseStatus::Ended | LeaseStatus::Failed);
        sqlx::query(
            r#"
            UPDATE session_leases
            SET status = $2,
                ended_at = CASE WHEN $3 THEN COALESCE(ended_at, $4) ELSE ended_at END,
                termination_reason = COALESCE($5, termination_reason)
            WHERE id = $1
            "#,
        )
        .bind(lease_id)
        .bind(status.as_str())
        .bind(terminal)
        .bind(now)
        .bind(termination_reason)
        .execute(&self.pool)
        .await
        .context("failed to update lease status")?;
        Ok(())
    }

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<SessionLease>> {
        let row: Option<LeaseRow> = sqlx::query_as("SELECT * FROM session_leases WHERE id = $1")
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get lease")?;
        Ok(row.map(Into::into))
    }

    async fn list_leases(&self, account_id: Uuid) -> Result<Vec<SessionLease>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT * FROM session_leases WHERE account_id = $1 ORDER BY started_at",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list leases")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn put_oauth_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states (state_hash, code_verifier, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(state_hash)
        .bind(code_verifier)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("failed to store oauth state")?;
        Ok(())
    }

    async fn consume_oauth_state(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM oauth_states
            WHERE state_hash = $1 AND expires_at > $2
            RETURNING code_verifier
            "#,
        )
        .bind(state_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to consume oauth state")?;
        Ok(row.map(|(verifier,)| verifier))
    }

    async fn clean_oauth_states(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to clean oauth states")?;
        Ok(result.rows_affected())
    }

    async fn append_audit(
        &self,
        account_id: Uuid,
        action: &str,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (account_id, action, detail, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(account_id)
        .bind(action)
        .bind(detail)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to append audit entry")?;
        Ok(())
    }

    async fn list_audit(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        sqlx::query_as(
            r#"
            SELECT * FROM audit_log
            WHERE account_id = $1
              AND ($2::timestamptz IS NULL OR created_at < $2)
              AND ($3::text IS NULL OR action = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(account_id)
        .bind(before)
        .bind(action)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to list audit entries")
        .map_err(Into::into)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}
