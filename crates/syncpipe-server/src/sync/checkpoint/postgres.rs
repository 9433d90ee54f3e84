//! `sync_checkpoints` table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use syncpipe_common::Value;

use super::{Checkpoint, CheckpointStore, CheckpointUpdate};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    source_id: String,
    field_name: String,
    last_value: Json<Value>,
    value_type: String,
    rows_pulled: i64,
    last_pulled_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = SyncError;

    fn try_from(row: CheckpointRow) -> SyncResult<Self> {
        Ok(Checkpoint {
            source_id: row.source_id,
            field: row.field_name,
            last_value: row.last_value.0,
            value_type: row.value_type.parse()?,
            rows_pulled: u64::try_from(row.rows_pulled).unwrap_or(0),
            last_pulled_at: row.last_pulled_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT source_id, field_name, last_value, value_type, rows_pulled, last_pulled_at FROM sync_checkpoints";

#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, source_id: &str, field: &str) -> SyncResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(&format!(
            "{} WHERE source_id = $1 AND field_name = $2",
            SELECT_COLUMNS
        ))
        .bind(source_id)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Checkpoint::try_from).transpose()
    }

    async fn advance(&self, update: CheckpointUpdate) -> SyncResult<Checkpoint> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, CheckpointRow>(&format!(
            "{} WHERE source_id = $1 AND field_name = $2 FOR UPDATE",
            SELECT_COLUMNS
        ))
        .bind(&update.source_id)
        .bind(&update.field)
        .fetch_optional(&mut *tx)
        .await?
        .map(Checkpoint::try_from)
        .transpose()?;

        if let Some(current) = &current {
            update.check_against(current)?;
        }

        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            INSERT INTO sync_checkpoints
                (source_id, field_name, last_value, value_type, rows_pulled, last_pulled_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (source_id, field_name) DO UPDATE SET
                last_value = EXCLUDED.last_value,
                value_type = EXCLUDED.value_type,
                rows_pulled = sync_checkpoints.rows_pulled + EXCLUDED.rows_pulled,
                last_pulled_at = EXCLUDED.last_pulled_at,
                updated_at = NOW()
            RETURNING source_id, field_name, last_value, value_type, rows_pulled, last_pulled_at
            "#,
        )
        .bind(&update.source_id)
        .bind(&update.field)
        .bind(Json(&update.value))
        .bind(update.value_type.as_str())
        .bind(i64::try_from(update.rows_pulled).unwrap_or(i64::MAX))
        .bind(update.pulled_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            source_id = %update.source_id,
            field = %update.field,
            value = %update.value.to_text(),
            "Checkpoint advanced"
        );

        Checkpoint::try_from(row)
    }

    async fn list(&self, source_id: &str) -> SyncResult<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(&format!(
            "{} WHERE source_id = $1 ORDER BY field_name",
            SELECT_COLUMNS
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Checkpoint::try_from).collect()
    }
}
