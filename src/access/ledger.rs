/// Write-through access operations
///
/// Pairs the in-memory grant store with its SQLite copy. Each operation holds an
/// async lock on the record it touches, a (workflow, email) grant slot or a
/// (workflow, identity) entitlement, across both the memory update and the row
/// write. Rows therefore land in the same order the records changed.

use crate::{
    access::{
        storage::GrantStorage,
        store::AccessGrantStore,
        types::{normalize_email, AccessEntitlement, EntitlementRole, InviteGrant},
    },
    error::{AccessError, GrantError},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    /// (workflow_id, normalized email)
    Grant(String, String),
    /// (workflow_id, identity)
    Entitlement(String, String),
}

impl LockKey {
    fn workflow_id(&self) -> &str {
        match self {
            LockKey::Grant(workflow_id, _) | LockKey::Entitlement(workflow_id, _) => workflow_id,
        }
    }
}

#[derive(Debug)]
pub struct AccessLedger {
    store: Arc<AccessGrantStore>,
    storage: GrantStorage,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl AccessLedger {
    pub fn new(store: Arc<AccessGrantStore>, storage: GrantStorage) -> Self {
        Self {
            store,
            storage,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<AccessGrantStore> {
        &self.store
    }

    pub fn storage(&self) -> &GrantStorage {
        &self.storage
    }

    async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.locks.entry(key).or_default());
        lock.lock_owned().await
    }

    async fn lock_slot(&self, workflow_id: &str, email: &str) -> OwnedMutexGuard<()> {
        self.lock(LockKey::Grant(workflow_id.to_string(), email.to_string())).await
    }

    async fn lock_entitlement(&self, workflow_id: &str, identity: &str) -> OwnedMutexGuard<()> {
        self.lock(LockKey::Entitlement(workflow_id.to_string(), identity.to_string()))
            .await
    }

    /// Write the slot's current grant. Must be called with the slot lock held.
    async fn persist_slot(&self, workflow_id: &str, email: &str) -> anyhow::Result<()> {
        if let Some(grant) = self.store.grant(workflow_id, email) {
            self.storage.save_grant(&grant).await?;
        }
        Ok(())
    }

    /// Like `persist_slot`, for failure paths where the caller's error wins
    async fn persist_slot_quietly(&self, workflow_id: &str, email: &str) {
        if let Err(e) = self.persist_slot(workflow_id, email).await {
            tracing::error!(workflow_id, "❌ Failed to persist invite grant: {:#}", e);
        }
    }

    pub async fn issue(&self, workflow_id: &str, email: &str) -> Result<InviteGrant, AccessError> {
        self.issue_at(workflow_id, email, Utc::now()).await
    }

    /// Issue a fresh code for the slot and persist it before releasing the slot
    pub async fn issue_at(
        &self,
        workflow_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<InviteGrant, AccessError> {
        let email = normalize_email(email);
        let _slot = self.lock_slot(workflow_id, &email).await;
        let grant = self.store.create_grant_at(workflow_id, &email, now);
        self.storage.save_grant(&grant).await?;
        Ok(grant)
    }

    /// Pending, unexpired grant for (email, code)
    ///
    /// A grant found past its expiry is flipped and written as `expired`.
    pub async fn validate(&self, email: &str, code: &str) -> Result<InviteGrant, AccessError> {
        let email = normalize_email(email);
        let now = Utc::now();
        let mut failure = GrantError::GrantNotFound { email: email.clone() };

        for workflow_id in self.store.slots_matching(&email, code) {
            let _slot = self.lock_slot(&workflow_id, &email).await;
            match self.store.lookup_slot_at(&workflow_id, &email, code, now) {
                Ok(grant) => return Ok(grant),
                Err(GrantError::GrantNotFound { .. }) => {}
                Err(err) => {
                    self.persist_slot_quietly(&workflow_id, &email).await;
                    failure = err;
                }
            }
        }
        Err(failure.into())
    }

    /// Redeem (email, code) for `identity`, persisting the accepted grant and
    /// the entitlement
    ///
    /// Slots whose workflow fails `is_live` are refused with `WorkflowGone`.
    pub async fn redeem<F>(
        &self,
        email: &str,
        code: &str,
        identity: &str,
        is_live: F,
    ) -> Result<AccessEntitlement, AccessError>
    where
        F: Fn(&str) -> bool,
    {
        let email = normalize_email(email);
        let now = Utc::now();
        let mut failure = AccessError::Grant(GrantError::GrantNotFound { email: email.clone() });

        for workflow_id in self.store.slots_matching(&email, code) {
            let _slot = self.lock_slot(&workflow_id, &email).await;
            if !is_live(&workflow_id) {
                tracing::debug!(workflow_id = %workflow_id, "🚫 Invite grant points at a deleted workflow");
                failure = AccessError::WorkflowGone(workflow_id);
                continue;
            }

            let _entitlement = self.lock_entitlement(&workflow_id, identity).await;
            match self.store.redeem_slot_at(&workflow_id, &email, code, identity, now) {
                Ok(entitlement) => {
                    self.persist_slot(&workflow_id, &email).await?;
                    self.storage.save_entitlement(&entitlement).await?;
                    return Ok(entitlement);
                }
                Err(GrantError::GrantNotFound { .. }) => {}
                Err(err) => {
                    self.persist_slot_quietly(&workflow_id, &email).await;
                    failure = err.into();
                }
            }
        }
        Err(failure)
    }

    /// Give `identity` access unless it already holds an entitlement.
    /// Returns the new entitlement, if one was created.
    pub async fn entitle(
        &self,
        workflow_id: &str,
        identity: &str,
        role: EntitlementRole,
    ) -> Result<Option<AccessEntitlement>, AccessError> {
        let _guard = self.lock_entitlement(workflow_id, identity).await;
        if self.store.entitlement(workflow_id, identity).is_some() {
            return Ok(None);
        }
        let entitlement = self.store.grant_access(workflow_id, identity, role);
        self.storage.save_entitlement(&entitlement).await?;
        Ok(Some(entitlement))
    }

    /// Drop every grant and entitlement of a deleted workflow, in memory and on disk
    ///
    /// Returns (grants removed, entitlements revoked).
    pub async fn forget_workflow(&self, workflow_id: &str) -> Result<(usize, usize), AccessError> {
        let mut grants = 0;
        for grant in self.store.grants_for_workflow(workflow_id) {
            let _slot = self.lock_slot(workflow_id, &grant.email).await;
            if self.store.remove_grant(workflow_id, &grant.email).is_some() {
                grants += 1;
            }
            self.storage.delete_grant(workflow_id, &grant.email).await?;
        }

        // Entitlements go second so a redemption that won its slot above is still revoked
        let mut entitlements = 0;
        for entitlement in self.store.entitlements_for_workflow(workflow_id) {
            let _guard = self.lock_entitlement(workflow_id, &entitlement.identity).await;
            if self.store.revoke_access(workflow_id, &entitlement.identity) {
                entitlements += 1;
            }
            self.storage.delete_entitlement(workflow_id, &entitlement.identity).await?;
        }

        self.locks
            .retain(|key, lock| key.workflow_id() != workflow_id || Arc::strong_count(lock) > 1);

        tracing::info!(workflow_id, grants, entitlements, "🧹 Dropped access records of deleted workflow");
        Ok((grants, entitlements))
    }
}
