//! Postgres outbox store.
//!
//! The claim uses `FOR UPDATE SKIP LOCKED` inside a CTE so concurrent
//! dispatcher processes select disjoint rows: locked rows are skipped
//! rather than waited on, and the status flip happens in the same
//! statement.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use causeway_core::{DomainError, DomainResult, EventId};

use crate::event_store::map_sqlx_error;

use super::{OutboxEntry, OutboxMetrics, OutboxStatus, OutboxStore};

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn claim_batch(
        &self,
        limit: usize,
        claim_timeout: Duration,
    ) -> DomainResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM event_outbox
                WHERE (
                        (status = 'pending'
                         AND (next_retry_at IS NULL OR next_retry_at < NOW()))
                        OR (status = 'processing' AND next_retry_at < NOW())
                      )
                  AND retry_count < max_retries
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE event_outbox
               SET status = 'processing',
                   next_retry_at = NOW() + make_interval(secs => $2)
             WHERE id IN (SELECT id FROM claimable)
            RETURNING id, event_id, event_type, aggregate_type, aggregate_id,
                      payload, status, retry_count, max_retries, last_error,
                      created_at, processed_at, next_retry_at
            "#,
        )
        .bind(limit as i64)
        .bind(claim_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox_batch", e))?;

        let mut entries: Vec<OutboxEntry> =
            rows.iter().map(entry_from_row).collect::<DomainResult<_>>()?;
        // RETURNING does not promise order; delivery order is by creation.
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    async fn mark_completed(&self, id: Uuid) -> DomainResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
               SET status = 'completed',
                   processed_at = NOW(),
                   next_retry_at = NULL
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_outbox_completed", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    async fn mark_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
               SET status = 'pending',
                   retry_count = retry_count + 1,
                   last_error = $2,
                   next_retry_at = $3
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_outbox_retry", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    async fn mark_failed(&self, id: Uuid, error: &str) -> DomainResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
               SET status = 'failed',
                   retry_count = retry_count + 1,
                   last_error = $2,
                   next_retry_at = NULL
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_outbox_failed", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn metrics(&self) -> DomainResult<OutboxMetrics> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM event_outbox
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_metrics", e))?;

        let mut metrics = OutboxMetrics::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("read_metrics_row", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("read_metrics_row", e))?;
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => metrics.pending = total as u64,
                OutboxStatus::Processing => metrics.processing = total as u64,
                OutboxStatus::Completed => metrics.completed = total as u64,
                OutboxStatus::Failed => metrics.failed = total as u64,
            }
        }
        Ok(metrics)
    }

    #[instrument(skip(self), err)]
    async fn entry(&self, id: Uuid) -> DomainResult<Option<OutboxEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, event_type, aggregate_type, aggregate_id,
                   payload, status, retry_count, max_retries, last_error,
                   created_at, processed_at, next_retry_at
            FROM event_outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> DomainResult<OutboxEntry> {
    let read = |e: sqlx::Error| map_sqlx_error("read_outbox_row", e);
    let status: String = row.try_get("status").map_err(read)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(read)?;
    let payload = serde_json::from_value(payload)
        .map_err(|e| DomainError::internal(format!("malformed outbox payload: {e}")))?;

    Ok(OutboxEntry {
        id: row.try_get("id").map_err(read)?,
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(read)?),
        event_type: row.try_get("event_type").map_err(read)?,
        aggregate_type: row.try_get("aggregate_type").map_err(read)?,
        aggregate_id: row.try_get("aggregate_id").map_err(read)?,
        payload,
        status: OutboxStatus::parse(&status)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(read)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(read)? as u32,
        last_error: row.try_get("last_error").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        processed_at: row.try_get("processed_at").map_err(read)?,
        next_retry_at: row.try_get("next_retry_at").map_err(read)?,
    })
}
