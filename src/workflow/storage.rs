/// SQLite persistence layer for workflow storage
///
/// Handles workflow load/save for the progression engine. Workflows, including
/// their steps and recorded sub-item progress, are stored as one JSON document per
/// row; the registry's per-workflow lock is what makes a save atomic per key.

use crate::workflow::types::Workflow;
use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::collections::HashMap;

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool for the workflow database
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool, shared with the access tables
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Private in-memory database with the schema applied
    ///
    /// Pinned to one connection: every `sqlite::memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create the `workflows` table (idempotent)
    ///
    /// `status` and `started_at` are copied out of the JSON document so the
    /// deadline sweep and operators can filter without decoding every row.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                started_at TEXT,
                step_count INTEGER NOT NULL DEFAULT 0,
                document JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating workflows table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status)")
            .execute(&self.pool)
            .await
            .context("creating workflows status index")?;

        Ok(())
    }

    /// Write the whole workflow document, replacing the row for its id
    ///
    /// Callers hold the workflow's writer lock, which orders saves per id.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let document = serde_json::to_string(workflow)
            .with_context(|| format!("encoding workflow '{}'", workflow.id))?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, status, started_at, step_count, document, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                started_at = excluded.started_at,
                step_count = excluded.step_count,
                document = excluded.document,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.started_at.map(|t| t.to_rfc3339()))
        .bind(workflow.steps.len() as i64)
        .bind(&document)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving workflow '{}'", workflow.id))?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        sqlx::query("SELECT id, document FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading workflow '{}'", id))?
            .map(|row| decode_row(&row))
            .transpose()
    }

    /// Every stored workflow keyed by id, for registry start-up
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let rows = sqlx::query("SELECT id, document FROM workflows")
            .fetch_all(&self.pool)
            .await
            .context("reading workflows")?;

        rows.iter()
            .map(|row| decode_row(row).map(|workflow| (workflow.id.clone(), workflow)))
            .collect()
    }

    /// Returns false when no row had this id
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting workflow '{}'", id))?
            .rows_affected();

        Ok(deleted > 0)
    }
}

fn decode_row(row: &SqliteRow) -> Result<Workflow> {
    let id: String = row.get("id");
    let document: String = row.get("document");
    serde_json::from_str(&document).with_context(|| format!("decoding workflow '{}'", id))
}
