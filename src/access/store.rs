/// Access grant store
///
/// Holds invite grants keyed by (workflow, email) and the entitlements they turn
/// into. Keying grants by the pair is what enforces "at most one grant per pair":
/// creating a grant replaces whatever sat in that slot. Each slot is a DashMap
/// entry, so create, validate and redeem for one pair are serialized by the
/// entry's shard lock while unrelated pairs proceed in parallel.
///
/// Pure data and validation: `access::ledger` pairs each change with its
/// `access::storage` write. Time-dependent operations have `*_at(now)` variants.

use crate::{
    access::types::{
        normalize_email, AccessEntitlement, EntitlementRole, EntitlementStatus, GrantStatus, Identity,
        InviteGrant,
    },
    error::GrantError,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;

/// (workflow_id, normalized email)
type GrantKey = (String, String);

/// (workflow_id, identity)
type EntitlementKey = (String, String);

/// Default validity window of a grant
pub const DEFAULT_GRANT_TTL_HOURS: i64 = 24;

#[derive(Debug)]
pub struct AccessGrantStore {
    grants: DashMap<GrantKey, InviteGrant>,
    entitlements: DashMap<EntitlementKey, AccessEntitlement>,
    ttl: Duration,
}

impl Default for AccessGrantStore {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_GRANT_TTL_HOURS))
    }
}

/// Uniform draw over [100000, 999999]
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

impl AccessGrantStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: DashMap::new(),
            entitlements: DashMap::new(),
            ttl,
        }
    }

    /// Restore previously persisted grants and entitlements
    pub fn load(&self, grants: Vec<InviteGrant>, entitlements: Vec<AccessEntitlement>) {
        for grant in grants {
            let key = (grant.workflow_id.clone(), normalize_email(&grant.email));
            self.grants.insert(key, grant);
        }
        for entitlement in entitlements {
            let key = (entitlement.workflow_id.clone(), entitlement.identity.clone());
            self.entitlements.insert(key, entitlement);
        }
    }

    pub fn create_grant(&self, workflow_id: &str, email: &str) -> InviteGrant {
        self.create_grant_at(workflow_id, email, Utc::now())
    }

    /// Issue a fresh code for (workflow, email), superseding any earlier grant for the pair
    pub fn create_grant_at(&self, workflow_id: &str, email: &str, now: DateTime<Utc>) -> InviteGrant {
        let email = normalize_email(email);
        let grant = InviteGrant {
            code: generate_code(),
            workflow_id: workflow_id.to_string(),
            email: email.clone(),
            status: GrantStatus::Pending,
            created_at: now,
            expires_at: now + self.ttl,
            accepted_by: None,
        };

        if let Some(previous) = self.grants.insert((workflow_id.to_string(), email.clone()), grant.clone()) {
            tracing::debug!(
                workflow_id,
                email = %email,
                previous_status = previous.status.as_str(),
                "🔄 Superseded earlier invite grant"
            );
        }

        tracing::info!(workflow_id, email = %email, expires_at = %grant.expires_at, "✉️ Invite grant created");
        grant
    }

    pub fn validate(&self, email: &str, code: &str) -> Option<InviteGrant> {
        self.validate_at(email, code, Utc::now())
    }

    /// Pending, unexpired grant for (email, code), or None.
    /// A matching grant past its expiry is flipped to `expired` on the way.
    pub fn validate_at(&self, email: &str, code: &str, now: DateTime<Utc>) -> Option<InviteGrant> {
        self.lookup_at(email, code, now).ok()
    }

    pub fn lookup(&self, email: &str, code: &str) -> Result<InviteGrant, GrantError> {
        self.lookup_at(email, code, Utc::now())
    }

    /// Like `validate_at`, but tells an expired code apart from an unknown one
    pub fn lookup_at(&self, email: &str, code: &str, now: DateTime<Utc>) -> Result<InviteGrant, GrantError> {
        let email = normalize_email(email);
        first_match(&email, self.slots_matching(&email, code), |workflow_id| {
            self.lookup_slot_at(workflow_id, &email, code, now)
        })
    }

    /// Check the single (workflow, email) slot against `code`
    ///
    /// An accepted grant counts as not found here. A pending grant past its expiry
    /// is flipped to `expired` under the slot guard.
    pub fn lookup_slot_at(
        &self,
        workflow_id: &str,
        email: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<InviteGrant, GrantError> {
        let email = normalize_email(email);
        let not_found = || GrantError::GrantNotFound { email: email.clone() };
        let expired = || GrantError::ExpiredGrant {
            email: email.clone(),
            workflow_id: workflow_id.to_string(),
        };

        let mut grant = self
            .grants
            .get_mut(&(workflow_id.to_string(), email.clone()))
            .ok_or_else(not_found)?;
        if grant.code != code {
            return Err(not_found());
        }

        match grant.status {
            GrantStatus::Pending if grant.is_expired_at(now) => {
                grant.status = GrantStatus::Expired;
                tracing::info!(workflow_id, email = %email, "⌛ Invite grant expired");
                Err(expired())
            }
            GrantStatus::Pending => Ok(grant.value().clone()),
            GrantStatus::Expired => Err(expired()),
            GrantStatus::Accepted => Err(not_found()),
        }
    }

    pub fn redeem(&self, grant: &InviteGrant, identity: &str) -> Result<AccessEntitlement, GrantError> {
        self.redeem_at(grant, identity, Utc::now())
    }

    /// Accept a grant on behalf of `identity` and activate its entitlement
    ///
    /// Idempotent for the identity that already accepted it; any other identity
    /// gets `AlreadyRedeemed`. A grant superseded since it was validated is gone.
    pub fn redeem_at(
        &self,
        grant: &InviteGrant,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessEntitlement, GrantError> {
        self.redeem_slot_at(&grant.workflow_id, &grant.email, &grant.code, identity, now)
    }

    pub fn redeem_code(&self, email: &str, code: &str, identity: &str) -> Result<AccessEntitlement, GrantError> {
        self.redeem_code_at(email, code, identity, Utc::now())
    }

    /// Look up and redeem in one step, reporting expiry and prior redemption distinctly
    pub fn redeem_code_at(
        &self,
        email: &str,
        code: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessEntitlement, GrantError> {
        let email = normalize_email(email);
        first_match(&email, self.slots_matching(&email, code), |workflow_id| {
            self.redeem_slot_at(workflow_id, &email, code, identity, now)
        })
    }

    /// Entitlement check: admins and managers always pass, others need an active entitlement
    pub fn has_access(&self, workflow_id: &str, identity: &Identity) -> bool {
        if identity.role.bypasses_entitlements() {
            return true;
        }
        self.entitlements
            .get(&(workflow_id.to_string(), identity.user_id.clone()))
            .map(|e| e.status == EntitlementStatus::Active)
            .unwrap_or(false)
    }

    /// Administrative grant of active access, updating any existing record in place
    pub fn grant_access(&self, workflow_id: &str, identity: &str, role: EntitlementRole) -> AccessEntitlement {
        let key = (workflow_id.to_string(), identity.to_string());
        let entry = self
            .entitlements
            .entry(key)
            .and_modify(|e| {
                e.role = role;
                e.status = EntitlementStatus::Active;
            })
            .or_insert_with(|| AccessEntitlement {
                workflow_id: workflow_id.to_string(),
                identity: identity.to_string(),
                role,
                status: EntitlementStatus::Active,
                invite_code: None,
            });
        entry.value().clone()
    }

    pub fn revoke_access(&self, workflow_id: &str, identity: &str) -> bool {
        self.entitlements
            .remove(&(workflow_id.to_string(), identity.to_string()))
            .is_some()
    }

    pub fn entitlement(&self, workflow_id: &str, identity: &str) -> Option<AccessEntitlement> {
        self.entitlements
            .get(&(workflow_id.to_string(), identity.to_string()))
            .map(|e| e.value().clone())
    }

    /// Every entitlement on a workflow
    pub fn entitlements_for_workflow(&self, workflow_id: &str) -> Vec<AccessEntitlement> {
        self.entitlements
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Current grant in the (workflow, email) slot
    pub fn grant(&self, workflow_id: &str, email: &str) -> Option<InviteGrant> {
        self.grants
            .get(&(workflow_id.to_string(), normalize_email(email)))
            .map(|g| g.value().clone())
    }

    /// Every grant issued for a workflow, oldest first
    pub fn grants_for_workflow(&self, workflow_id: &str) -> Vec<InviteGrant> {
        let mut grants: Vec<InviteGrant> = self
            .grants
            .iter()
            .filter(|g| g.workflow_id == workflow_id)
            .map(|g| g.value().clone())
            .collect();
        grants.sort_by_key(|g| g.created_at);
        grants
    }

    /// Workflows whose slot for `email` currently holds `code`. Collected first
    /// so no shard lock is held while individual slots are mutated.
    pub fn slots_matching(&self, email: &str, code: &str) -> Vec<String> {
        let email = normalize_email(email);
        self.grants
            .iter()
            .filter(|entry| entry.key().1 == email && entry.code == code)
            .map(|entry| entry.key().0.clone())
            .collect()
    }

    /// Redeem the single (workflow, email) slot for `identity`
    pub fn redeem_slot_at(
        &self,
        workflow_id: &str,
        email: &str,
        code: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessEntitlement, GrantError> {
        let email = normalize_email(email);
        let not_found = || GrantError::GrantNotFound { email: email.clone() };
        let expired = || GrantError::ExpiredGrant {
            email: email.clone(),
            workflow_id: workflow_id.to_string(),
        };

        // The slot guard is held until the entitlement is written
        let mut grant = self
            .grants
            .get_mut(&(workflow_id.to_string(), email.clone()))
            .ok_or_else(not_found)?;
        if grant.code != code {
            return Err(not_found());
        }

        match grant.status {
            GrantStatus::Accepted => {
                if grant.accepted_by.as_deref() == Some(identity) {
                    tracing::debug!(workflow_id, identity, "Invite grant already redeemed by this identity");
                    return Ok(self.activate_entitlement(workflow_id, identity, &grant.code));
                }
                return Err(GrantError::AlreadyRedeemed {
                    email: email.clone(),
                    workflow_id: workflow_id.to_string(),
                });
            }
            GrantStatus::Expired => return Err(expired()),
            GrantStatus::Pending if grant.is_expired_at(now) => {
                grant.status = GrantStatus::Expired;
                return Err(expired());
            }
            GrantStatus::Pending => {}
        }

        grant.status = GrantStatus::Accepted;
        grant.accepted_by = Some(identity.to_string());
        let entitlement = self.activate_entitlement(workflow_id, identity, &grant.code);

        tracing::info!(workflow_id, identity, "✅ Invite grant redeemed");
        Ok(entitlement)
    }

    /// Empty one (workflow, email) slot
    pub fn remove_grant(&self, workflow_id: &str, email: &str) -> Option<InviteGrant> {
        self.grants
            .remove(&(workflow_id.to_string(), normalize_email(email)))
            .map(|(_, grant)| grant)
    }

    fn activate_entitlement(&self, workflow_id: &str, identity: &str, code: &str) -> AccessEntitlement {
        let entry = self
            .entitlements
            .entry((workflow_id.to_string(), identity.to_string()))
            .and_modify(|e| {
                e.role = EntitlementRole::Participant;
                e.status = EntitlementStatus::Active;
                e.invite_code = Some(code.to_string());
            })
            .or_insert_with(|| AccessEntitlement {
                workflow_id: workflow_id.to_string(),
                identity: identity.to_string(),
                role: EntitlementRole::Participant,
                status: EntitlementStatus::Active,
                invite_code: Some(code.to_string()),
            });
        entry.value().clone()
    }
}

/// Try `attempt` on each candidate slot: the first success wins, a not-found slot
/// is skipped, and any other failure is reported when nothing succeeds
fn first_match<T>(
    email: &str,
    workflow_ids: Vec<String>,
    mut attempt: impl FnMut(&str) -> Result<T, GrantError>,
) -> Result<T, GrantError> {
    let mut failure = GrantError::GrantNotFound { email: email.to_string() };
    for workflow_id in workflow_ids {
        match attempt(&workflow_id) {
            Ok(found) => return Ok(found),
            Err(GrantError::GrantNotFound { .. }) => {}
            Err(err) => failure = err,
        }
    }
    Err(failure)
}
