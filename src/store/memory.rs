//! In-memory store backend.
//!
//! One async mutex over plain tables. Every trait method locks, mutates,
//! unlocks; that serializes multi-step mutations exactly like the Postgres
//! backend's transactions do, so the contracts (no over-draw, single
//! account per fingerprint, single-use OAuth state) hold identically.
//! Used by the test suite and by DATABASE_URL-less boots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto;
use crate::error::{AppError, Result};
use crate::store::models::*;
use crate::store::Store;

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    identities: Vec<(Uuid, OAuthIdentity)>,
    keypairs: HashMap<Uuid, Keypair>,
    tokens: HashMap<Uuid, TokenRecord>,
    connections: HashMap<Uuid, Connection>,
    leases: HashMap<Uuid, SessionLease>,
    ledger: Vec<LedgerEntry>,
    next_ledger_id: i64,
    stripe_events: HashMap<String, (String, DateTime<Utc>)>,
    account_sessions: HashMap<Uuid, AccountSession>,
    oauth_states: HashMap<String, (String, DateTime<Utc>)>,
    audit: Vec<AuditEntry>,
    next_audit_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_account(id: Uuid, display_name: String, now: DateTime<Utc>) -> Account {
    Account {
        id,
        display_name,
        email: None,
        balance_seconds: 0,
        created_at: now,
        last_seen_at: now,
        active: true,
    }
}

impl Tables {
    fn append_ledger(
        &mut self,
        account_id: Uuid,
        delta_seconds: i64,
        reason: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) {
        self.next_ledger_id += 1;
        self.ledger.push(LedgerEntry {
            id: self.next_ledger_id,
            account_id,
            delta_seconds,
            reason: reason.to_string(),
            reference: reference.to_string(),
            created_at: now,
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn resolve_or_create_account(&self, new: NewAccountWithKey) -> Result<ResolvedAccount> {
        let mut t = self.tables.lock().await;

        if let Some(existing) = t
            .keypairs
            .values()
            .find(|k| k.fingerprint == new.fingerprint)
            .cloned()
        {
            let account = t
                .accounts
                .get(&existing.account_id)
                .cloned()
                .ok_or_else(|| AppError::not_found("keypair owner missing"))?;
            return Ok(ResolvedAccount {
                account,
                keypair: existing,
                is_new: false,
            });
        }

        let now = Utc::now();
        let account = new_account(new.account_id, new.display_name, now);
        let keypair = Keypair {
            id: Uuid::new_v4(),
            account_id: account.id,
            label: new.key_label,
            algorithm: "ed25519".to_string(),
            public_key_openssh: new.public_key_openssh,
            fingerprint: new.fingerprint,
            private_key_ciphertext: new.private_key_ciphertext,
            created_at: now,
            active: true,
        };
        t.accounts.insert(account.id, account.clone());
        t.keypairs.insert(keypair.id, keypair.clone());
        Ok(ResolvedAccount {
            account,
            keypair,
            is_new: true,
        })
    }

    async fn upsert_oauth_account(&self, new: NewOAuthIdentity) -> Result<(Account, bool)> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();

        if let Some((owner, identity)) = t
            .identities
            .iter_mut()
            .find(|(_, i)| i.provider == new.provider && i.provider_user_id == new.provider_user_id)
        {
            identity.provider_username = new.provider_username;
            identity.provider_email = new.provider_email;
            identity.access_token_ciphertext = new.access_token_ciphertext;
            identity.scopes = new.scopes;
            let owner = *owner;
            let account = t
                .accounts
                .get_mut(&owner)
                .ok_or_else(|| AppError::not_found("identity owner missing"))?;
            account.last_seen_at = now;
            return Ok((account.clone(), false));
        }

        let mut account = new_account(
            new.candidate_account_id,
            new.provider_username.clone(),
            now,
        );
        account.email = new.provider_email.clone();
        t.accounts.insert(account.id, account.clone());
        t.identities.push((
            account.id,
            OAuthIdentity {
                provider: new.provider,
                provider_user_id: new.provider_user_id,
                provider_username: new.provider_username,
                provider_email: new.provider_email,
                access_token_ciphertext: new.access_token_ciphertext,
                scopes: new.scopes,
            },
        ));
        Ok((account, true))
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        Ok(self.tables.lock().await.accounts.get(&account_id).cloned())
    }

    async fn touch_account(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(account) = self.tables.lock().await.accounts.get_mut(&account_id) {
            account.last_seen_at = now;
        }
        Ok(())
    }

    async fn list_oauth_identities(&self, account_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        Ok(self
            .tables
            .lock()
            .await
            .identities
            .iter()
            .filter(|(owner, _)| *owner == account_id)
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn update_oauth_token(
        &self,
        provider: &str,
        provider_user_id: &str,
        access_token_ciphertext: &str,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        if let Some((_, identity)) = t
            .identities
            .iter_mut()
            .find(|(_, i)| i.provider == provider && i.provider_user_id == provider_user_id)
        {
            identity.access_token_ciphertext = access_token_ciphertext.to_string();
        }
        Ok(())
    }

    async fn add_key(&self, new: NewKeypair) -> Result<Keypair> {
        let mut t = self.tables.lock().await;
        if !t.accounts.contains_key(&new.account_id) {
            return Err(AppError::not_found("account not found"));
        }
        if t.keypairs
            .values()
            .any(|k| k.account_id == new.account_id && k.fingerprint == new.fingerprint)
        {
            return Err(AppError::conflict(
                "duplicate_fingerprint",
                "a key with this fingerprint already exists",
            ));
        }
        let keypair = Keypair {
            id: new.id,
            account_id: new.account_id,
            label: new.label,
            algorithm: "ed25519".to_string(),
            public_key_openssh: new.public_key_openssh,
            fingerprint: new.fingerprint,
            private_key_ciphertext: new.private_key_ciphertext,
            created_at: Utc::now(),
            active: true,
        };
        t.keypairs.insert(keypair.id, keypair.clone());
        Ok(keypair)
    }

    async fn remove_key(&self, account_id: Uuid, key_id: Uuid) -> Result<()> {
        let mut t = self.tables.lock().await;
        let owned_active = t
            .keypairs
            .values()
            .filter(|k| k.account_id == account_id && k.active)
            .count();
        let Some(key) = t.keypairs.get_mut(&key_id) else {
            return Err(AppError::not_found("key not found"));
        };
        if key.account_id != account_id || !key.active {
            return Err(AppError::not_found("key not found"));
        }
        if owned_active <= 1 {
            return Err(AppError::conflict(
                "last_key",
                "an account must retain at least one active key",
            ));
        }
        key.active = false;
        Ok(())
    }

    async fn list_keys(&self, account_id: Uuid) -> Result<Vec<Keypair>> {
        let t = self.tables.lock().await;
        let mut keys: Vec<_> = t
            .keypairs
            .values()
            .filter(|k| k.account_id == account_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn get_key(&self, account_id: Uuid, key_id: Uuid) -> Result<Option<Keypair>> {
        Ok(self
            .tables
            .lock()
            .await
            .keypairs
            .get(&key_id)
            .filter(|k| k.account_id == account_id)
            .cloned())
    }

    async fn get_active_keypair(&self, account_id: Uuid) -> Result<Option<Keypair>> {
        let t = self.tables.lock().await;
        Ok(t.keypairs
            .values()
            .filter(|k| k.account_id == account_id && k.active)
            .min_by_key(|k| k.created_at)
            .cloned())
    }

    async fn issue_token(&self, new: NewToken, now: DateTime<Utc>) -> Result<IssuedToken> {
        let plaintext = crypto::generate_token();
        let record = TokenRecord {
            id: Uuid::new_v4(),
            token_hash: crypto::hash_token(&plaintext),
            account_id: new.account_id,
            bound_session_id: new.bound_session_id,
            client_ip: new.client_ip,
            user_agent: new.user_agent,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(new.ttl)
                    .map_err(|e| AppError::validation(format!("invalid ttl: {e}")))?,
            revoked_at: None,
        };
        self.tables
            .lock()
            .await
            .tokens
            .insert(record.id, record.clone());
        Ok(IssuedToken { plaintext, record })
    }

    async fn get_account_by_token(
        &self,
        token_plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Account, TokenRecord)>> {
        let hash = crypto::hash_token(token_plaintext);
        let t = self.tables.lock().await;
        let Some(record) = t.tokens.values().find(|r| r.token_hash == hash) else {
            return Ok(None);
        };
        if !record.is_valid_at(now) {
            return Ok(None);
        }
        let Some(account) = t.accounts.get(&record.account_id) else {
            return Ok(None);
        };
        Ok(Some((account.clone(), record.clone())))
    }

    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.tables.lock().await.tokens.get_mut(&token_id) {
            record.revoked_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn revoke_tokens_by_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let mut count = 0;
        for record in t.tokens.values_mut() {
            if record.bound_session_id == Some(session_id) && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn clean_expired_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let before = t.tokens.len();
        t.tokens
            .retain(|_, r| r.revoked_at.is_none() && r.expires_at > now);
        Ok((before - t.tokens.len()) as u64)
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
        let mut t = self.tables.lock().await;
        let account = t
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| AppError::not_found("account not found"))?;
        account.balance_seconds += seconds;
        let balance = account.balance_seconds;
        t.append_ledger(account_id, seconds, reason, reference, now);
        Ok(balance)
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
        let mut t = self.tables.lock().await;
        let account = t
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| AppError::not_found("account not found"))?;
        if account.balance_seconds < seconds {
            return Ok(DebitOutcome::InsufficientFunds);
        }
        account.balance_seconds -= seconds;
        let balance = account.balance_seconds;
        t.append_ledger(
            account_id,
            -seconds,
            &format!("session_debit:{session_id}"),
            &session_id.to_string(),
            now,
        );
        Ok(DebitOutcome::Applied(balance))
    }

    async fn list_ledger(&self, account_id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .tables
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn record_stripe_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.tables.lock().await;
        if t.stripe_events.contains_key(event_id) {
            return Ok(false);
        }
        t.stripe_events
            .insert(event_id.to_string(), (event_type.to_string(), now));
        Ok(true)
    }

    async fn has_processed_stripe_event(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .stripe_events
            .contains_key(event_id))
    }

    async fn start_account_session(
        &self,
        session_id: Uuid,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.tables.lock().await.account_sessions.insert(
            session_id,
            AccountSession {
                session_id,
                account_id,
                started_at: now,
                last_debit_at: None,
                ended_at: None,
            },
        );
        Ok(())
    }

    async fn end_account_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut t = self.tables.lock().await;
        match t.account_sessions.get_mut(&session_id) {
            Some(row) if row.ended_at.is_none() => {
                row.ended_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_account_id_for_session(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .tables
            .lock()
            .await
            .account_sessions
            .get(&session_id)
            .filter(|row| row.ended_at.is_none())
            .map(|row| row.account_id))
    }

    async fn list_open_account_sessions(&self) -> Result<Vec<AccountSession>> {
        Ok(self
            .tables
            .lock()
            .await
            .account_sessions
            .values()
            .filter(|row| row.ended_at.is_none())
            .cloned()
            .collect())
    }

    async fn record_session_debit(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self
            .tables
            .lock()
            .await
            .account_sessions
            .get_mut(&session_id)
        {
            row.last_debit_at = Some(now);
        }
        Ok(())
    }

    async fn create_connection(&self, new: NewConnection) -> Result<Connection> {
        let mut t = self.tables.lock().await;
        if t.connections.values().any(|c| {
            c.account_id == new.account_id
                && c.host == new.host
                && c.port == new.port
                && c.username == new.username
        }) {
            return Err(AppError::conflict(
                "duplicate_connection",
                "a connection for this target already exists",
            ));
        }
        let connection = Connection {
            id: new.id,
            account_id: new.account_id,
            keypair_id: new.keypair_id,
            host: new.host,
            port: new.port,
            username: new.username,
            label: new.label,
            pinned_host_key_fingerprint: None,
            pinned_host_key: None,
            last_test_result: None,
            last_test_at: None,
            created_at: Utc::now(),
        };
        t.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn get_connection(&self, account_id: Uuid, id: Uuid) -> Result<Option<Connection>> {
        Ok(self
            .tables
            .lock()
            .await
            .connections
            .get(&id)
            .filter(|c| c.account_id == account_id)
            .cloned())
    }

    async fn find_connection(
        &self,
        account_id: Uuid,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<Option<Connection>> {
        Ok(self
            .tables
            .lock()
            .await
            .connections
            .values()
            .find(|c| {
                c.account_id == account_id
                    && c.host == host
                    && c.port == port
                    && c.username == username
            })
            .cloned())
    }

    async fn list_connections(&self, account_id: Uuid) -> Result<Vec<Connection>> {
        let t = self.tables.lock().await;
        let mut connections: Vec<_> = t
            .connections
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.created_at);
        Ok(connections)
    }

    async fn update_connection(
        &self,
        account_id: Uuid,
        id: Uuid,
        patch: ConnectionPatch,
    ) -> Result<Connection> {
        let mut t = self.tables.lock().await;
        let Some(connection) = t
            .connections
            .get_mut(&id)
            .filter(|c| c.account_id == account_id)
        else {
            return Err(AppError::not_found("connection not found"));
        };
        if let Some(label) = patch.label {
            connection.label = label;
        }
        if let Some(keypair_id) = patch.keypair_id {
            connection.keypair_id = keypair_id;
        }
        Ok(connection.clone())
    }

    async fn delete_connection(&self, account_id: Uuid, id: Uuid) -> Result<()> {
        let mut t = self.tables.lock().await;
        match t.connections.get(&id) {
            Some(c) if c.account_id == account_id => {
                t.connections.remove(&id);
                Ok(())
            }
            _ => Err(AppError::not_found("connection not found")),
        }
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
        let mut t = self.tables.lock().await;
        let Some(connection) = t.connections.get_mut(&id) else {
            return Err(AppError::not_found("connection not found"));
        };
        connection.last_test_result = Some(result);
        connection.last_test_at = Some(now);
        let may_pin = connection.pinned_host_key_fingerprint.is_none() || accept_host_key;
        if may_pin && let Some(fingerprint) = host_key_fingerprint {
            connection.pinned_host_key_fingerprint = Some(fingerprint.to_string());
            connection.pinned_host_key = host_key.map(str::to_string);
        }
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

        let mut t = self.tables.lock().await;
        let live = t
            .leases
            .values()
            .filter(|l| l.account_id == account_id && l.status.counts_against_cap())
            .count();
        if live >= cap {
            return Err(AppError::conflict(
                "session_limit_reached",
                format!("at most {cap} concurrent sessions per account"),
            ));
        }

        let lease = SessionLease {
            id: lease_id,
            account_id,
            connection_id,
            status: LeaseStatus::Pending,
            started_at: now,
            ended_at: None,
            termination_reason: None,
        };
        t.leases.insert(lease.id, lease.clone());

        t.account_sessions.insert(
            lease_id,
            AccountSession {
                session_id: lease_id,
                account_id,
                started_at: now,
                last_debit_at: None,
                ended_at: None,
            },
        );

        let plaintext = crypto::generate_token();
        let record = TokenRecord {
            id: Uuid::new_v4(),
            token_hash: crypto::hash_token(&plaintext),
            account_id,
            bound_session_id: Some(lease_id),
            client_ip: token.client_ip,
            user_agent: token.user_agent,
            created_at: now,
            expires_at,
            revoked_at: None,
        };
        t.tokens.insert(record.id, record.clone());

        Ok((lease, IssuedToken { plaintext, record }))
    }

    async fn count_active_leases(&self, account_id: Uuid) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .await
            .leases
            .values()
            .filter(|l| l.account_id == account_id && l.status.counts_against_cap())
            .count())
    }

    async fn update_lease_status(
        &self,
        lease_id: Uuid,
        status: LeaseStatus,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        let Some(lease) = t.leases.get_mut(&lease_id) else {
            return Err(AppError::not_found("lease not found"));
        };
        lease.status = status;
        if matches!(status, LeaseStatus::Ended | LeaseStatus::Failed) {
            lease.ended_at.get_or_insert(now);
            if let Some(reason) = termination_reason {
                lease.termination_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<SessionLease>> {
        Ok(self.tables.lock().await.leases.get(&lease_id).cloned())
    }

    async fn list_leases(&self, account_id: Uuid) -> Result<Vec<SessionLease>> {
        let t = self.tables.lock().await;
        let mut leases: Vec<_> = t
            .leases
            .values()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect();
        leases.sort_by_key(|l| l.started_at);
        Ok(leases)
    }

    async fn put_oauth_state(
        &self,
        state_hash: &str,
        code_verifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.tables
            .lock()
            .await
            .oauth_states
            .insert(state_hash.to_string(), (code_verifier.to_string(), expires_at));
        Ok(())
    }

    async fn consume_oauth_state(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut t = self.tables.lock().await;
        match t.oauth_states.remove(state_hash) {
            Some((verifier, expires_at)) if expires_at > now => Ok(Some(verifier)),
            _ => Ok(None),
        }
    }

    async fn clean_oauth_states(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let before = t.oauth_states.len();
        t.oauth_states.retain(|_, (_, expires)| *expires > now);
        Ok((before - t.oauth_states.len()) as u64)
    }

    async fn append_audit(
        &self,
        account_id: Uuid,
        action: &str,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.next_audit_id += 1;
        let entry = AuditEntry {
            id: t.next_audit_id,
            account_id,
            action: action.to_string(),
            detail,
            created_at: now,
        };
        t.audit.push(entry);
        Ok(())
    }

    async fn list_audit(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let t = self.tables.lock().await;
        let mut entries: Vec<_> = t
            .audit
            .iter()
            .filter(|e| e.account_id == account_id)
            .filter(|e| before.is_none_or(|b| e.created_at < b))
            .filter(|e| action.is_none_or(|a| e.action == a))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
