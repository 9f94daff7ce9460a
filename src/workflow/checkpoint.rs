// Recovery log - terminal run and batch snapshots persisted as JSONB
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

use crate::error::CheckpointError;
use crate::types::{BatchRun, PipelineRun};

const KIND_RUN: &str = "run";
const KIND_BATCH: &str = "batch";

/// Saves and loads snapshots of finished runs and batches
pub struct RunCheckpointer {
    pool: PgPool,
}

impl RunCheckpointer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Setup checkpoint table
    pub async fn setup(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_run_checkpoints (
                checkpoint_id VARCHAR(255) PRIMARY KEY,
                owner_id VARCHAR(255) NOT NULL,
                kind VARCHAR(16) NOT NULL,
                status VARCHAR(32) NOT NULL,
                snapshot JSONB NOT NULL,
                version INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_run_checkpoints_owner
            ON workflow_run_checkpoints(owner_id, kind)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_run_checkpoints_created_at
            ON workflow_run_checkpoints(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("✅ Run checkpoint table setup complete");
        Ok(())
    }

    pub async fn save_run(&self, run: &PipelineRun) -> Result<String, CheckpointError> {
        let status = serde_json::to_value(run.status)?;
        self.save(&run.id, KIND_RUN, status.as_str().unwrap_or("unknown"), run).await
    }

    pub async fn save_batch(&self, batch: &BatchRun) -> Result<String, CheckpointError> {
        let status = serde_json::to_value(batch.status)?;
        self.save(&batch.id, KIND_BATCH, status.as_str().unwrap_or("unknown"), batch).await
    }

    pub async fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, CheckpointError> {
        self.load_latest(run_id, KIND_RUN).await
    }

    pub async fn load_batch(&self, batch_id: &str) -> Result<Option<BatchRun>, CheckpointError> {
        self.load_latest(batch_id, KIND_BATCH).await
    }

    async fn save<T: Serialize>(&self, owner_id: &str, kind: &str, status: &str, snapshot: &T) -> Result<String, CheckpointError> {
        let checkpoint_id = format!("{}::{}::{}", kind, owner_id, Utc::now().timestamp_millis());

        let current_version: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(version) FROM workflow_run_checkpoints WHERE owner_id = $1 AND kind = $2",
        )
        .bind(owner_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        let version = current_version.unwrap_or(0) + 1;

        let snapshot = serde_json::to_value(snapshot)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_run_checkpoints
            (checkpoint_id, owner_id, kind, status, snapshot, version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&checkpoint_id)
        .bind(owner_id)
        .bind(kind)
        .bind(status)
        .bind(snapshot)
        .bind(version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!("💾 Checkpoint saved: {} (version: {})", checkpoint_id, version);
        Ok(checkpoint_id)
    }

    async fn load_latest<T: DeserializeOwned>(&self, owner_id: &str, kind: &str) -> Result<Option<T>, CheckpointError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT checkpoint_id, snapshot, version, created_at
            FROM workflow_run_checkpoints
            WHERE owner_id = $1 AND kind = $2
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                tracing::debug!(
                    checkpoint_id = %row.checkpoint_id,
                    version = row.version,
                    saved_at = %row.created_at,
                    "loaded checkpoint"
                );
                Ok(Some(serde_json::from_value(row.snapshot)?))
            }
            None => Ok(None),
        }
    }

    /// Delete old checkpoints (cleanup)
    pub async fn cleanup_old_checkpoints(&self, older_than_days: i64) -> Result<u64, CheckpointError> {
        let cutoff_date = Utc::now() - chrono::Duration::days(older_than_days);

        let result = sqlx::query("DELETE FROM workflow_run_checkpoints WHERE created_at < $1")
            .bind(cutoff_date)
            .execute(&self.pool)
            .await?;

        info!("🧹 Cleaned up {} old checkpoints", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    checkpoint_id: String,
    snapshot: serde_json::Value,
    version: i32,
    created_at: DateTime<Utc>,
}
