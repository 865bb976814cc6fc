//! Postgres write path and event log.
//!
//! `with_transaction` is the one pattern every repository follows: begin,
//! write entity state, write events + outbox rows, commit. No external I/O
//! happens inside the transaction; queue contact is the dispatcher's job.
//!
//! ## Error mapping
//!
//! SQLx errors surface as `DomainError` with kind:
//!
//! | PostgreSQL error code | Kind | Scenario |
//! |---|---|---|
//! | `23505` (unique violation) | `concurrency` | Concurrent insert on a guarded key |
//! | `40001` (serialization failure) | `concurrency` | Concurrent transaction conflict |
//! | other database / pool / io | `infrastructure` (service `postgres`) | Connectivity, bad SQL, etc. |

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use causeway_core::{DomainError, DomainResult, EventId};
use causeway_events::NewEvent;

use super::EventLogEntry;

/// Boxed transaction-scoped future, so callers can pass async closures
/// over `&mut Transaction` without higher-kinded gymnastics.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = DomainResult<T>> + Send + 't>>;

/// Run `f` inside one database transaction: commit on `Ok`, roll back on
/// `Err` and return the original failure.
pub async fn with_transaction<T, F>(pool: &PgPool, f: F) -> DomainResult<T>
where
    F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T>,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    match f(&mut tx).await {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(value)
        }
        Err(err) => {
            // Rollback failure is secondary; the caller gets the original error.
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

/// Insert events into the log and matching pending rows into the outbox,
/// in input order, inside the caller's transaction.
///
/// The outbox payload embeds the event payload plus its full metadata so
/// dispatch never re-reads the event row. Returns the event ids in input
/// order.
pub async fn persist_events(
    tx: &mut Transaction<'static, Postgres>,
    events: &[NewEvent],
) -> DomainResult<Vec<EventId>> {
    let mut ids = Vec::with_capacity(events.len());
    let now = Utc::now();

    for event in events {
        let metadata = serde_json::to_value(&event.metadata)
            .map_err(|e| DomainError::internal(format!("event metadata serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO domain_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                event_version,
                payload,
                metadata,
                occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(event.schema_version as i32)
        .bind(&event.payload)
        .bind(&metadata)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        let outbox_payload = serde_json::json!({
            "data": event.payload,
            "metadata": event.metadata,
        });

        sqlx::query(
            r#"
            INSERT INTO event_outbox (
                id,
                event_id,
                event_type,
                aggregate_type,
                aggregate_id,
                payload,
                status,
                retry_count,
                max_retries,
                last_error,
                created_at,
                processed_at,
                next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, NULL, $8, NULL, NULL)
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(event.event_id.as_uuid())
        .bind(&event.event_type)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&outbox_payload)
        .bind(crate::outbox::DEFAULT_MAX_RETRIES as i32)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox_entry", e))?;

        ids.push(event.event_id);
    }

    Ok(ids)
}

/// Read side of the event log, for operators and invariant checks.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Events for one aggregate, oldest first.
    #[instrument(skip(self), err)]
    pub async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> DomainResult<Vec<EventLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, occurred_at
            FROM domain_events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for_aggregate", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Events sharing a correlation id, oldest first.
    #[instrument(skip(self), err)]
    pub async fn events_for_correlation(
        &self,
        correlation_id: &str,
    ) -> DomainResult<Vec<EventLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, occurred_at
            FROM domain_events
            WHERE metadata->>'correlation_id' = $1
            ORDER BY id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for_correlation", e))?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> DomainResult<EventLogEntry> {
    let read = |e: sqlx::Error| map_sqlx_error("read_event_row", e);
    let metadata: serde_json::Value = row.try_get("metadata").map_err(read)?;
    let metadata = serde_json::from_value(metadata)
        .map_err(|e| DomainError::internal(format!("malformed event metadata: {e}")))?;

    Ok(EventLogEntry {
        event_id: EventId::from_uuid(row.try_get("id").map_err(read)?),
        aggregate_type: row.try_get("aggregate_type").map_err(read)?,
        aggregate_id: row.try_get("aggregate_id").map_err(read)?,
        event_type: row.try_get("event_type").map_err(read)?,
        schema_version: row.try_get::<i32, _>("event_version").map_err(read)? as u32,
        payload: row.try_get("payload").map_err(read)?,
        metadata,
        occurred_at: row.try_get("occurred_at").map_err(read)?,
    })
}

/// Map a SQLx error onto the domain taxonomy.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => DomainError::concurrency(message),
                Some("40001") => DomainError::concurrency(message),
                _ => DomainError::infrastructure("postgres", message),
            }
        }
        other => DomainError::infrastructure(
            "postgres",
            format!("sqlx error in {operation}: {other}"),
        ),
    }
}
