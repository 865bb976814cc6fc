//! Policy read model: a flat summary row per policy, maintained from the
//! event stream.
//!
//! Second registry consumer alongside the audit sink; it exists so the
//! pipeline always exercises multi-handler dispatch and per-handler
//! idempotency. The summary is disposable; events are the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{debug, instrument};

use causeway_core::{DomainError, DomainResult};
use causeway_events::{DeliveredEvent, EventHandler};

use crate::event_store::map_sqlx_error;

/// Handler name recorded in the idempotency ledger.
pub const PROJECTION_HANDLER: &str = "policy-projection";

const SUBSCRIPTIONS: &[&str] = &["policy.*"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub policy_id: String,
    pub name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Upsert-style storage for the summary read model.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Insert or update one summary row. `name` is only present on
    /// creation events; transitions update the status in place.
    async fn upsert(
        &self,
        policy_id: &str,
        name: Option<&str>,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    async fn get(&self, policy_id: &str) -> DomainResult<Option<PolicySummary>>;
}

/// In-memory summary store for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemorySummaryStore {
    summaries: Mutex<HashMap<String, PolicySummary>>,
    upserts: AtomicU64,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total writes, for idempotency assertions.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn upsert(
        &self,
        policy_id: &str,
        name: Option<&str>,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut summaries = self.summaries.lock().unwrap();
        self.upserts.fetch_add(1, Ordering::SeqCst);
        match summaries.get_mut(policy_id) {
            Some(summary) => {
                if let Some(name) = name {
                    summary.name = name.to_string();
                }
                summary.status = status.to_string();
                summary.updated_at = updated_at;
            }
            None => {
                summaries.insert(
                    policy_id.to_string(),
                    PolicySummary {
                        policy_id: policy_id.to_string(),
                        name: name.unwrap_or_default().to_string(),
                        status: status.to_string(),
                        updated_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get(&self, policy_id: &str) -> DomainResult<Option<PolicySummary>> {
        Ok(self.summaries.lock().unwrap().get(policy_id).cloned())
    }
}

/// Postgres summary store.
#[derive(Debug, Clone)]
pub struct PostgresSummaryStore {
    pool: PgPool,
}

impl PostgresSummaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SummaryStore for PostgresSummaryStore {
    #[instrument(skip(self), err)]
    async fn upsert(
        &self,
        policy_id: &str,
        name: Option<&str>,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO policy_summaries (policy_id, name, status, updated_at)
            VALUES ($1, COALESCE($2, ''), $3, $4)
            ON CONFLICT (policy_id) DO UPDATE
            SET name = COALESCE($2, policy_summaries.name),
                status = $3,
                updated_at = $4
            "#,
        )
        .bind(policy_id)
        .bind(name)
        .bind(status)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_policy_summary", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, policy_id: &str) -> DomainResult<Option<PolicySummary>> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT policy_id, name, status, updated_at
            FROM policy_summaries
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_policy_summary", e))?;

        row.map(|row| {
            let read = |e: sqlx::Error| map_sqlx_error("read_summary_row", e);
            Ok(PolicySummary {
                policy_id: row.try_get("policy_id").map_err(read)?,
                name: row.try_get("name").map_err(read)?,
                status: row.try_get("status").map_err(read)?,
                updated_at: row.try_get("updated_at").map_err(read)?,
            })
        })
        .transpose()
    }
}

/// The read-model handler.
pub struct PolicyProjection {
    store: Arc<dyn SummaryStore>,
}

impl PolicyProjection {
    pub fn new(store: Arc<dyn SummaryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for PolicyProjection {
    fn name(&self) -> &'static str {
        PROJECTION_HANDLER
    }

    fn subscribed_event_types(&self) -> &[&'static str] {
        SUBSCRIPTIONS
    }

    async fn invoke(&self, event: &DeliveredEvent) -> DomainResult<()> {
        let status = event
            .payload
            .get("status")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                DomainError::internal(format!(
                    "{} payload carries no status field",
                    event.event_type
                ))
            })?;
        let name = event.payload.get("name").and_then(JsonValue::as_str);

        debug!(
            policy_id = %event.aggregate_id,
            status,
            "updating policy summary"
        );
        self.store
            .upsert(
                &event.aggregate_id,
                name,
                status,
                event.metadata.produced_at,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{Actor, CommandMetadata, EventId};
    use causeway_events::EventMetadata;
    use serde_json::json;

    fn delivered(event_type: &str, aggregate_id: &str, payload: JsonValue) -> DeliveredEvent {
        let meta = CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now());
        DeliveredEvent {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_type: "policy".into(),
            aggregate_id: aggregate_id.into(),
            payload,
            metadata: EventMetadata::from_command(&meta, 1),
        }
    }

    #[tokio::test]
    async fn creation_then_transition_updates_summary() {
        let store = Arc::new(InMemorySummaryStore::new());
        let projection = PolicyProjection::new(store.clone());

        projection
            .invoke(&delivered(
                "policy.created",
                "p-1",
                json!({"name": "P", "status": "draft"}),
            ))
            .await
            .unwrap();

        projection
            .invoke(&delivered(
                "policy.activated",
                "p-1",
                json!({"status": "active", "previous_status": "draft"}),
            ))
            .await
            .unwrap();

        let summary = store.get("p-1").await.unwrap().unwrap();
        assert_eq!(summary.name, "P");
        assert_eq!(summary.status, "active");
        assert_eq!(store.upsert_count(), 2);
    }

    #[tokio::test]
    async fn missing_status_is_a_handler_failure() {
        let store = Arc::new(InMemorySummaryStore::new());
        let projection = PolicyProjection::new(store.clone());

        let err = projection
            .invoke(&delivered("policy.created", "p-1", json!({"name": "P"})))
            .await
            .unwrap_err();
        assert!(err.message.contains("no status field"));
    }
}
