/// SQLite persistence for invite grants and entitlements
///
/// Grants are keyed by (workflow_id, email), mirroring the store's slots, so an
/// upsert of a new grant is also the supersession of the previous one.

use crate::access::types::{
    AccessEntitlement, EntitlementRole, EntitlementStatus, GrantStatus, InviteGrant,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

#[derive(Debug, Clone)]
pub struct GrantStorage {
    pool: SqlitePool,
}

impl GrantStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create grant and entitlement tables (idempotent)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invite_grants (
                workflow_id TEXT NOT NULL,
                email TEXT NOT NULL,
                code TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                accepted_by TEXT,
                PRIMARY KEY (workflow_id, email)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_access (
                workflow_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL,
                invite_code TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (workflow_id, identity)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_invite_grants_email ON invite_grants(email)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Upsert the grant occupying its (workflow, email) slot
    pub async fn save_grant(&self, grant: &InviteGrant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO invite_grants (workflow_id, email, code, status, created_at, expires_at, accepted_by)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workflow_id, email) DO UPDATE SET
                code = excluded.code,
                status = excluded.status,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                accepted_by = excluded.accepted_by
            "#,
        )
        .bind(&grant.workflow_id)
        .bind(&grant.email)
        .bind(&grant.code)
        .bind(grant.status.as_str())
        .bind(grant.created_at.to_rfc3339())
        .bind(grant.expires_at.to_rfc3339())
        .bind(&grant.accepted_by)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving invite grant for '{}' on '{}'", grant.email, grant.workflow_id))?;

        Ok(())
    }

    /// Upsert an entitlement, refreshing its `updated_at`
    pub async fn save_entitlement(&self, entitlement: &AccessEntitlement) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_access (workflow_id, identity, role, status, invite_code, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(workflow_id, identity) DO UPDATE SET
                role = excluded.role,
                status = excluded.status,
                invite_code = excluded.invite_code,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&entitlement.workflow_id)
        .bind(&entitlement.identity)
        .bind(entitlement.role.as_str())
        .bind(entitlement.status.as_str())
        .bind(&entitlement.invite_code)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "saving entitlement of '{}' on '{}'",
                entitlement.identity, entitlement.workflow_id
            )
        })?;

        Ok(())
    }

    /// Remove the grant row of one (workflow, email) slot
    pub async fn delete_grant(&self, workflow_id: &str, email: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM invite_grants WHERE workflow_id = ? AND email = ?")
            .bind(workflow_id)
            .bind(email)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting invite grant for '{}' on '{}'", email, workflow_id))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_entitlement(&self, workflow_id: &str, identity: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_access WHERE workflow_id = ? AND identity = ?")
            .bind(workflow_id)
            .bind(identity)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn load_grants(&self) -> Result<Vec<InviteGrant>> {
        let rows = sqlx::query(
            "SELECT workflow_id, email, code, status, created_at, expires_at, accepted_by FROM invite_grants",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<InviteGrant> {
                let status: String = row.get("status");
                let created_at: String = row.get("created_at");
                let expires_at: String = row.get("expires_at");
                Ok(InviteGrant {
                    workflow_id: row.get("workflow_id"),
                    email: row.get("email"),
                    code: row.get("code"),
                    status: GrantStatus::parse(&status)
                        .ok_or_else(|| anyhow!("unknown grant status '{}'", status))?,
                    created_at: parse_timestamp(&created_at)?,
                    expires_at: parse_timestamp(&expires_at)?,
                    accepted_by: row.get("accepted_by"),
                })
            })
            .collect()
    }

    pub async fn load_entitlements(&self) -> Result<Vec<AccessEntitlement>> {
        let rows = sqlx::query("SELECT workflow_id, identity, role, status, invite_code FROM workflow_access")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<AccessEntitlement> {
                let role: String = row.get("role");
                let status: String = row.get("status");
                Ok(AccessEntitlement {
                    workflow_id: row.get("workflow_id"),
                    identity: row.get("identity"),
                    role: EntitlementRole::parse(&role)
                        .ok_or_else(|| anyhow!("unknown entitlement role '{}'", role))?,
                    status: EntitlementStatus::parse(&status)
                        .ok_or_else(|| anyhow!("unknown entitlement status '{}'", status))?,
                    invite_code: row.get("invite_code"),
                })
            })
            .collect()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::store::AccessGrantStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn storage() -> GrantStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = GrantStorage::new(pool);
        storage.init_schema().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn grants_round_trip_through_the_store() {
        let storage = storage().await;
        let store = AccessGrantStore::default();
        let grant = store.create_grant("wf-1", "a@x.com");
        storage.save_grant(&grant).await.unwrap();
        let entitlement = store.redeem(&grant, "u-1").unwrap();
        storage.save_grant(&store.grant("wf-1", "a@x.com").unwrap()).await.unwrap();
        storage.save_entitlement(&entitlement).await.unwrap();

        let restored = AccessGrantStore::default();
        restored.load(
            storage.load_grants().await.unwrap(),
            storage.load_entitlements().await.unwrap(),
        );
        let reloaded = restored.grant("wf-1", "a@x.com").unwrap();
        assert_eq!(reloaded.status, GrantStatus::Accepted);
        assert_eq!(reloaded.accepted_by.as_deref(), Some("u-1"));
        assert_eq!(reloaded.expires_at.timestamp(), grant.expires_at.timestamp());
        assert_eq!(restored.entitlement("wf-1", "u-1"), Some(entitlement));
    }

    #[tokio::test]
    async fn new_grant_row_replaces_the_old_one() {
        let storage = storage().await;
        let store = AccessGrantStore::default();
        storage.save_grant(&store.create_grant("wf-1", "a@x.com")).await.unwrap();
        let latest = store.create_grant("wf-1", "a@x.com");
        storage.save_grant(&latest).await.unwrap();

        let grants = storage.load_grants().await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].code, latest.code);
    }

    #[tokio::test]
    async fn grant_rows_can_be_deleted() {
        let storage = storage().await;
        let store = AccessGrantStore::default();
        storage.save_grant(&store.create_grant("wf-1", "a@x.com")).await.unwrap();
        storage.save_grant(&store.create_grant("wf-2", "a@x.com")).await.unwrap();

        assert!(storage.delete_grant("wf-1", "a@x.com").await.unwrap());
        assert!(!storage.delete_grant("wf-1", "a@x.com").await.unwrap());
        let left = storage.load_grants().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].workflow_id, "wf-2");
    }

    #[tokio::test]
    async fn entitlements_can_be_deleted() {
        let storage = storage().await;
        let store = AccessGrantStore::default();
        let entitlement = store.grant_access("wf-1", "u-1", EntitlementRole::Viewer);
        storage.save_entitlement(&entitlement).await.unwrap();
        assert!(storage.delete_entitlement("wf-1", "u-1").await.unwrap());
        assert!(storage.load_entitlements().await.unwrap().is_empty());
    }
}
