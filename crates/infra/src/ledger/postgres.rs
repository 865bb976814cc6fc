//! Postgres idempotency ledger.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use causeway_core::{DomainResult, EventId};

use crate::event_store::map_sqlx_error;

use super::ProcessedEventLedger;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventLedger for PostgresLedger {
    #[instrument(skip(self), err)]
    async fn has(&self, event_id: EventId, handler_name: &str) -> DomainResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND handler_name = $2
            ) AS present
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(handler_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_has", e))?;

        row.try_get("present")
            .map_err(|e| map_sqlx_error("read_ledger_row", e))
    }

    #[instrument(skip(self), err)]
    async fn record(&self, event_id: EventId, handler_name: &str) -> DomainResult<()> {
        // Duplicate key is success; ON CONFLICT absorbs the race with a
        // concurrent delivery of the same event.
        sqlx::query(
            r#"
            INSERT INTO processed_events (id, event_id, handler_name, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id, handler_name) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(event_id.as_uuid())
        .bind(handler_name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_record", e))?;

        Ok(())
    }
}
