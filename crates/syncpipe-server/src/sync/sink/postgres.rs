//! `synced_batches` table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use syncpipe_common::{DataBatch, DataRecord};
use uuid::Uuid;

use super::{BatchSink, CommitReceipt};
use crate::error::SyncResult;

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    batch_id: Uuid,
    sequence: i32,
    source_id: String,
    produced_at: DateTime<Utc>,
    records: Json<Vec<DataRecord>>,
}

impl From<BatchRow> for DataBatch {
    fn from(row: BatchRow) -> Self {
        DataBatch {
            batch_id: row.batch_id,
            sequence: u32::try_from(row.sequence).unwrap_or(0),
            source_id: row.source_id,
            produced_at: row.produced_at,
            records: row.records.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSink for PgSink {
    async fn commit(&self, batch: &DataBatch, idempotency_key: &str) -> SyncResult<CommitReceipt> {
        let committed_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO synced_batches
                (batch_id, sequence, source_id, idempotency_key, produced_at, row_count, records, committed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (batch_id, sequence) DO NOTHING
            "#,
        )
        .bind(batch.batch_id)
        .bind(i32::try_from(batch.sequence).unwrap_or(i32::MAX))
        .bind(&batch.source_id)
        .bind(idempotency_key)
        .bind(batch.produced_at)
        .bind(i64::try_from(batch.len()).unwrap_or(i64::MAX))
        .bind(Json(&batch.records))
        .bind(committed_at)
        .execute(&mut *tx)
        .await?;

        // Rows and the committed state of their reservation land together
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = 'committed', committed_at = $2
            WHERE key = $1 AND state = 'reserved'
            "#,
        )
        .bind(idempotency_key)
        .bind(committed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let inserted = result.rows_affected() > 0;
        Ok(CommitReceipt {
            rows_written: if inserted { batch.len() as u64 } else { 0 },
            inserted,
            committed_at,
        })
    }

    async fn batches(&self, source_id: &str) -> SyncResult<Vec<DataBatch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT batch_id, sequence, source_id, produced_at, records
            FROM synced_batches
            WHERE source_id = $1
            ORDER BY committed_at, sequence
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DataBatch::from).collect())
    }
}
